//! Boot probe: authorization check, resource-credit estimation, startup
//! notices, node ranking, and the startup gate.

use std::sync::Arc;

use tracing::{error, info};

use podping_writer_core::podping::{startup_operation_id, StartupNotice};

use crate::api::WriterError;
use crate::engine::{StartupState, WriterInner};
use crate::hive::ChainError;
use crate::publisher::PublishError;

/// Run the probe once and resolve the startup gate.
pub(crate) async fn run(inner: Arc<WriterInner>) -> Result<(), WriterError> {
    let result = probe(&inner).await;
    match &result {
        Ok(()) => {
            inner.set_startup_state(StartupState::Ready);
            info!(account = %inner.config.server_account, "hive account ready");
        }
        Err(err) => {
            inner.set_startup_state(StartupState::Failed);
            error!("startup of podping status: FAILED! {err}");
        }
    }
    result
}

async fn probe(inner: &WriterInner) -> Result<(), WriterError> {
    let settings = inner.config.settings.get().await;
    let allowed = inner
        .chain
        .allowed_accounts(&settings.control_account)
        .await
        .map_err(|err| WriterError::StartupFailed(format!("fetching allowed accounts: {err}")))?;
    if !allowed.contains(&inner.config.server_account) {
        // The chain will reject the operations anyway; keep running so a
        // restart loop stays observable instead of crash-looping.
        error!(
            account = %inner.config.server_account,
            control_account = %settings.control_account,
            "account not authorised to send podpings",
        );
    }

    if inner.config.resource_test && !inner.config.dry_run {
        info!(
            "podping startup sequence initiated, please stand by, \
             full bozo checks in operation..."
        );
        match test_hive_resources(inner).await {
            Ok(()) => info!("startup of podping status: SUCCESS! hit the boost button"),
            Err(PublishError::Chain(ChainError::BadKey(message))) => {
                return Err(WriterError::InvalidPostingKey(message));
            }
            Err(err) => return Err(WriterError::StartupFailed(err.to_string())),
        }
    }

    inner.chain.rank_nodes().await;
    info!(node = %inner.chain.current_node(), "fastest node selected");
    Ok(())
}

/// Measure the cost of a representative startup operation, project capacity,
/// and announce readiness on chain.
async fn test_hive_resources(inner: &WriterInner) -> Result<(), PublishError> {
    let manabar = inner
        .chain
        .resource_credits(&inner.config.server_account)
        .await?;
    info!(
        mana_percent = format_args!("{:.2}", manabar.last_mana_percent),
        "testing account resource credits",
    );

    let notice = StartupNotice::initiated(
        inner.config.server_account.clone(),
        inner.chain.current_node().to_string(),
    );
    let operation_id = startup_operation_id(inner.publisher.operation_id_prefix());

    let op = inner
        .publisher
        .construct_operation(&serde_json::to_value(&notice)?, &operation_id)?;
    let rc_cost = inner.chain.rc_cost(&op).await?;

    let percent_after =
        100.0 * (manabar.last_mana - 1e6 * rc_cost * 100.0) / manabar.max_mana;
    let percent_drop = manabar.last_mana_percent - percent_after;
    let capacity = if percent_drop > 0.0 {
        (100.0 / percent_drop) * 100.0
    } else {
        f64::INFINITY
    };
    info!(
        percent_drop = format_args!("{percent_drop:.2}"),
        capacity = format_args!("{capacity:.0}"),
        "projected resource credits for 100 pings",
    );

    let notice = notice.completed(
        env!("CARGO_PKG_VERSION"),
        format!("{capacity:.0}"),
        inner.chain.current_node().to_string(),
    );
    inner
        .publisher
        .send_notification(&serde_json::to_value(&notice)?, &operation_id)
        .await?;
    Ok(())
}
