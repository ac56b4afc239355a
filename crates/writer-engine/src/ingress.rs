//! Request-reply ingestion endpoint: one UTF-8 line per request, one reply
//! line per request (`OK` or `Invalid IRI`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context as _;
use iri_string::types::IriStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::Counters;

const REPLY_OK: &str = "OK";
const REPLY_INVALID: &str = "Invalid IRI";

/// Accept loop. Binds the configured endpoint, publishes the bound address,
/// and serves connections until cancelled; dropping the future closes the
/// listening socket.
pub(crate) async fn run(
    listen_addr: SocketAddr,
    counters: Arc<Counters>,
    iri_tx: mpsc::UnboundedSender<String>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("bind podping endpoint {listen_addr}"))?;
    let local_addr = listener.local_addr().context("read bound address")?;
    let _ = bound_tx.send(Some(local_addr));
    info!(%local_addr, "listening for IRIs");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let counters = counters.clone();
                        let iri_tx = iri_tx.clone();
                        connections.spawn(async move {
                            if let Err(err) = serve_connection(stream, counters, iri_tx).await {
                                debug!(%peer, "ingress connection ended: {err:#}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Serve one peer: any number of request/reply pairs, exactly one reply per
/// request, until the peer hangs up.
async fn serve_connection(
    stream: TcpStream,
    counters: Arc<Counters>,
    iri_tx: mpsc::UnboundedSender<String>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let candidate = line.trim_end_matches('\r');
        let reply = if IriStr::new(candidate).is_ok() {
            if iri_tx.send(candidate.to_string()).is_err() {
                // Engine is shutting down; stop accepting work.
                break;
            }
            counters.iris_in_flight.fetch_add(1, Ordering::SeqCst);
            counters.total_iris_recv.fetch_add(1, Ordering::Relaxed);
            REPLY_OK
        } else {
            debug!(candidate, "rejected invalid IRI");
            REPLY_INVALID
        };
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}
