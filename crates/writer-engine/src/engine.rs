//! Runtime assembly: shared state, queues, the startup gate, and the
//! supervising loop that ties the pipeline tasks together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::info;

use crate::api::{CountersSnapshot, WriterConfig, WriterError, WriterHandle};
use crate::hive::Chain;
use crate::publisher::Publisher;
use crate::{coalescer, ingress, startup, status, submitter};

/// Pipeline counters. Totals are each written by exactly one task; the
/// in-flight counter is written by ingress (+) and the submitter (−).
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) total_iris_recv: AtomicU64,
    pub(crate) total_iris_recv_deduped: AtomicU64,
    pub(crate) total_iris_sent: AtomicU64,
    pub(crate) iris_in_flight: AtomicI64,
}

/// Outcome of the startup probe, gating the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartupState {
    Pending,
    Ready,
    Failed,
}

pub(crate) struct WriterInner {
    pub(crate) config: WriterConfig,
    pub(crate) chain: Arc<dyn Chain>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) publisher: Publisher,
    startup_state: watch::Sender<StartupState>,
    bound_addr: watch::Receiver<Option<SocketAddr>>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    started_at: Instant,
}

impl WriterInner {
    pub(crate) fn new(
        config: WriterConfig,
        chain: Arc<dyn Chain>,
        bound_addr: watch::Receiver<Option<SocketAddr>>,
    ) -> Arc<Self> {
        let counters = Arc::new(Counters::default());
        let publisher = Publisher::new(
            chain.clone(),
            counters.clone(),
            config.server_account.clone(),
            config.operation_id.clone(),
            config.dry_run,
        );
        let (startup_state, _) = watch::channel(StartupState::Pending);
        Arc::new(Self {
            config,
            chain,
            counters,
            publisher,
            startup_state,
            bound_addr,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            started_at: Instant::now(),
        })
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("stop requested, draining");
            self.stop_notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub(crate) async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn set_startup_state(&self, state: StartupState) {
        let _ = self.startup_state.send(state);
    }

    /// Block until the startup probe resolves; `true` means the pipeline may
    /// publish.
    pub(crate) async fn wait_startup_ready(&self) -> bool {
        let mut state = self.startup_state.subscribe();
        match state.wait_for(|s| *s != StartupState::Pending).await {
            Ok(state) => *state == StartupState::Ready,
            Err(_) => false,
        }
    }

    pub(crate) fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound_addr.clone()
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn counters_snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_iris_recv: self.counters.total_iris_recv.load(Ordering::Relaxed),
            total_iris_recv_deduped: self
                .counters
                .total_iris_recv_deduped
                .load(Ordering::Relaxed),
            total_iris_sent: self.counters.total_iris_sent.load(Ordering::Relaxed),
            iris_in_flight: self.counters.iris_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Spawn the writer runtime.
pub(crate) fn start(config: WriterConfig, chain: Arc<dyn Chain>) -> WriterHandle {
    let (bound_tx, bound_rx) = watch::channel(None);
    let inner = WriterInner::new(config, chain, bound_rx);
    let join = tokio::spawn(run(inner.clone(), bound_tx));
    WriterHandle { inner, join }
}

/// Await an optional task once; later polls park forever so the select loop
/// can keep running its other arms.
async fn join_once<T>(
    slot: &mut Option<JoinHandle<T>>,
) -> Result<T, tokio::task::JoinError> {
    match slot.as_mut() {
        Some(task) => {
            let result = task.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn run(
    inner: Arc<WriterInner>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
) -> Result<(), WriterError> {
    let mut startup = Some(tokio::spawn(startup::run(inner.clone())));

    let mut side: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let (mut coalescer, mut submitter) = if inner.config.daemon {
        let (iri_tx, iri_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let listen = SocketAddr::new(inner.config.listen_ip, inner.config.listen_port);
        side.spawn(ingress::run(
            listen,
            inner.counters.clone(),
            iri_tx,
            bound_tx,
        ));
        if inner.config.status {
            side.spawn(status::report_loop(inner.clone()));
            side.spawn(status::authorization_loop(inner.clone()));
        }

        let coalescer = tokio::spawn(coalescer::run(
            inner.config.settings.clone(),
            inner.counters.clone(),
            iri_rx,
            batch_tx,
        ));
        let submitter = tokio::spawn(submitter::run(inner.clone(), batch_rx));
        (Some(coalescer), Some(submitter))
    } else {
        drop(bound_tx);
        (None, None)
    };

    let daemon = inner.config.daemon;
    let mut stopping = false;
    let mut result: Result<(), WriterError> = Ok(());

    loop {
        tokio::select! {
            _ = inner.stopped(), if !stopping => {
                stopping = true;
                // Close the intake; the coalescer flushes its window and the
                // submitter drains the queue before the loop ends.
                side.abort_all();
                if !daemon {
                    break;
                }
            }
            res = join_once(&mut startup) => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => { result = Err(err); break; }
                    Err(err) => {
                        result = Err(WriterError::Task(format!("startup task died: {err}")));
                        break;
                    }
                }
            }
            res = join_once(&mut coalescer) => {
                match res {
                    Ok(()) if stopping => {}
                    Ok(()) => {
                        result = Err(WriterError::Task("coalescer exited unexpectedly".to_string()));
                        break;
                    }
                    Err(err) => {
                        result = Err(WriterError::Task(format!("coalescer died: {err}")));
                        break;
                    }
                }
            }
            res = join_once(&mut submitter) => {
                match res {
                    Ok(Ok(())) if stopping => break,
                    Ok(Ok(())) => {
                        result = Err(WriterError::Task("submitter exited unexpectedly".to_string()));
                        break;
                    }
                    Ok(Err(fatal)) => { result = Err(fatal); break; }
                    Err(err) => {
                        result = Err(WriterError::Task(format!("submitter died: {err}")));
                        break;
                    }
                }
            }
            Some(res) = side.join_next(), if !side.is_empty() => {
                match res {
                    Err(err) if err.is_cancelled() => {}
                    // The authorization re-check returns right after it
                    // requests the stop; that is not a crash.
                    _ if stopping || inner.should_stop() => {}
                    Ok(Ok(())) => {
                        result = Err(WriterError::Task("writer task exited unexpectedly".to_string()));
                        break;
                    }
                    Ok(Err(err)) => {
                        result = Err(WriterError::Task(format!("writer task failed: {err:#}")));
                        break;
                    }
                    Err(err) => {
                        result = Err(WriterError::Task(format!("writer task died: {err}")));
                        break;
                    }
                }
            }
        }
    }

    if let Some(task) = &startup {
        task.abort();
    }
    if let Some(task) = &coalescer {
        task.abort();
    }
    if let Some(task) = &submitter {
        task.abort();
    }
    side.abort_all();
    while side.join_next().await.is_some() {}

    if result.is_ok() {
        info!("writer stopped cleanly");
    }
    result
}
