//! Batch windows: drains the IRI queue into deduplicated, time- and
//! size-bounded batches for the submitter.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, trace};
use uuid::Uuid;

use podping_writer_core::settings::SettingsManager;

use crate::engine::Counters;

/// A deduplicated set of IRIs destined for a single on-chain operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IriBatch {
    pub(crate) batch_id: Uuid,
    pub(crate) iri_set: HashSet<String>,
}

/// Projected byte size of the accumulated IRIs serialized as a JSON array of
/// quoted strings: each IRI plus two quotes, one comma between consecutive
/// elements, and the two outer brackets.
pub(crate) fn projected_size(size_without_commas: usize, count: usize) -> usize {
    if count == 0 {
        0
    } else {
        size_without_commas + (count - 1) + 2
    }
}

/// Run batch windows until the IRI queue closes; the final partial window is
/// flushed so a graceful drain loses nothing.
pub(crate) async fn run(
    settings: Arc<SettingsManager>,
    counters: Arc<Counters>,
    mut iri_rx: mpsc::UnboundedReceiver<String>,
    batch_tx: mpsc::UnboundedSender<IriBatch>,
) {
    let mut queue_closed = false;
    while !queue_closed {
        // The settings snapshot is fixed for the whole window.
        let settings = settings.get().await;
        let period = Duration::from_secs(settings.hive_operation_period);
        let max_bytes = settings.max_url_list_bytes;

        let window_start = Instant::now();
        let batch_id = Uuid::new_v4();
        let mut iri_set: HashSet<String> = HashSet::new();
        let mut size_without_commas = 0usize;
        let mut projected = 0usize;

        loop {
            let elapsed = window_start.elapsed();
            if elapsed >= period || projected >= max_bytes {
                break;
            }
            match tokio::time::timeout(period - elapsed, iri_rx.recv()).await {
                Ok(Some(iri)) => {
                    trace!(%batch_id, %iri, iris = iri_set.len() + 1, "coalescing");
                    if iri_set.insert(iri.clone()) {
                        size_without_commas += iri.len() + 2;
                    }
                    projected = projected_size(size_without_commas, iri_set.len());
                }
                Ok(None) => {
                    queue_closed = true;
                    break;
                }
                // Window timer expired with nothing queued; the loop
                // condition closes the window.
                Err(_) => {}
            }
        }

        if iri_set.is_empty() {
            continue;
        }
        counters
            .total_iris_recv_deduped
            .fetch_add(iri_set.len() as u64, Ordering::Relaxed);
        info!(%batch_id, iris = iri_set.len(), projected_bytes = projected, "batch window closed");
        if batch_tx.send(IriBatch { batch_id, iri_set }).is_err() {
            return;
        }
    }
}
