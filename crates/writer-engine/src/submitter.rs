//! Single consumer of the batch queue: publishes each batch with linear
//! backoff and node rotation, and retires it against the in-flight counter.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use podping_writer_core::podping::{Medium, Reason};

use crate::api::WriterError;
use crate::coalescer::IriBatch;
use crate::engine::WriterInner;
use crate::publisher::PublishError;

/// Extra backoff per accumulated failure, in seconds.
const RETRY_SLEEP_STEP_SECS: u64 = 3;

/// Backoff ceiling, in seconds.
const RETRY_SLEEP_MAX_SECS: u64 = 300;

/// How one batch was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    /// Published after `failures` failed attempts.
    Published { failures: u32 },
    /// Dropped: the payload can never broadcast, or the retry budget ran out.
    Dropped,
}

/// Drain the batch queue until it closes. At most one batch is in flight.
pub(crate) async fn run(
    inner: Arc<WriterInner>,
    mut batch_rx: mpsc::UnboundedReceiver<IriBatch>,
) -> Result<(), WriterError> {
    while let Some(batch) = batch_rx.recv().await {
        if !inner.wait_startup_ready().await {
            // Startup failed; the supervisor is already tearing down.
            return Ok(());
        }

        let started = Instant::now();
        let iri_count = batch.iri_set.len();
        let result = publish_with_retry(
            &inner,
            &batch.iri_set,
            inner.config.medium,
            inner.config.reason,
        )
        .await;

        // The batch is retired either way: success or terminal failure.
        inner
            .counters
            .iris_in_flight
            .fetch_sub(iri_count as i64, Ordering::SeqCst);

        match result {
            Ok(BatchOutcome::Published { failures }) => {
                info!(
                    batch_id = %batch.batch_id,
                    iris = iri_count,
                    failures,
                    duration_ms = started.elapsed().as_millis() as u64,
                    last_node = %inner.chain.current_node(),
                    "batch published",
                );
            }
            Ok(BatchOutcome::Dropped) => {
                warn!(batch_id = %batch.batch_id, iris = iri_count, "batch dropped");
            }
            Err(fatal) => return Err(fatal),
        }
    }
    Ok(())
}

/// Publish one IRI set, retrying transient failures with a linear backoff of
/// `min(3 · failures, 300)` seconds. The node ring advances after every
/// attempt. Retries are unbounded unless `max_attempts` is configured.
pub(crate) async fn publish_with_retry(
    inner: &WriterInner,
    iris: &HashSet<String>,
    medium: Medium,
    reason: Reason,
) -> Result<BatchOutcome, WriterError> {
    let mut failure_count: u32 = 0;

    loop {
        if failure_count > 0 {
            let sleep_secs =
                (u64::from(failure_count) * RETRY_SLEEP_STEP_SECS).min(RETRY_SLEEP_MAX_SECS);
            warn!(failure_count, sleep_secs, "waiting before retry");
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
            info!(failure_count, iris = iris.len(), "retrying publish");
        } else {
            info!(iris = iris.len(), "publishing");
        }

        let attempt = inner
            .publisher
            .send_notification_iris(iris, medium, reason)
            .await;
        inner.chain.advance_node();

        match attempt {
            Ok(()) => {
                if failure_count > 0 {
                    info!(failure_count, "publish recovered");
                }
                return Ok(BatchOutcome::Published {
                    failures: failure_count,
                });
            }
            Err(PublishError::MissingPostingAuth { account }) => {
                for iri in iris {
                    error!(%iri, "unpublished IRI");
                }
                error!(%account, "posting authority missing, terminating");
                return Err(WriterError::InvalidPostingKey(format!(
                    "missing posting authority for @{account}"
                )));
            }
            Err(err) if err.is_unretryable() => {
                error!("dropping batch: {err}");
                return Ok(BatchOutcome::Dropped);
            }
            Err(err) => {
                failure_count += 1;
                warn!(failure_count, iris = iris.len(), "publish failed: {err}");
                if let Some(max_attempts) = inner.config.max_attempts {
                    if failure_count >= max_attempts {
                        error!(attempts = failure_count, "retry budget exhausted, dropping batch");
                        return Ok(BatchOutcome::Dropped);
                    }
                }
            }
        }
    }
}
