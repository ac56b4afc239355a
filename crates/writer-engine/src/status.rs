//! Periodic diagnostics and the allowed-account re-check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::WriterInner;

/// Re-rank the node ring and log a status line every
/// `diagnostic_report_period` seconds. Failures are logged and swallowed.
pub(crate) async fn report_loop(inner: Arc<WriterInner>) -> anyhow::Result<()> {
    loop {
        inner.chain.rank_nodes().await;
        let counters = inner.counters_snapshot();
        info!(
            uptime = %format_uptime(inner.uptime()),
            iris_received = counters.total_iris_recv,
            iris_deduped = counters.total_iris_recv_deduped,
            iris_sent = counters.total_iris_sent,
            node = %inner.chain.current_node(),
            "status",
        );

        let settings = inner.config.settings.get().await;
        tokio::time::sleep(Duration::from_secs(settings.diagnostic_report_period)).await;
    }
}

/// Periodically confirm the account is still in the allowed set; on
/// revocation, log and request a graceful drain so the process exits
/// cleanly once the queues are empty.
pub(crate) async fn authorization_loop(inner: Arc<WriterInner>) -> anyhow::Result<()> {
    loop {
        let settings = inner.config.settings.get().await;
        tokio::time::sleep(Duration::from_secs(settings.control_account_check_period)).await;

        match inner.chain.allowed_accounts(&settings.control_account).await {
            Ok(allowed) => {
                if !allowed.contains(&inner.config.server_account) {
                    error!(
                        account = %inner.config.server_account,
                        control_account = %settings.control_account,
                        "account removed from the allowed set, draining and shutting down",
                    );
                    inner.request_stop();
                    return Ok(());
                }
            }
            Err(err) => warn!("allowed-account re-check failed: {err}"),
        }
    }
}

fn format_uptime(uptime: Duration) -> String {
    let total_secs = uptime.as_secs();
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}
