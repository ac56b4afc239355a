//! Public API types for the podping writer engine.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use reqwest::Url;

use podping_writer_core::podping::{Medium, Reason};
use podping_writer_core::settings::SettingsManager;

use crate::hive::{ChainError, HiveRpc};
use crate::submitter::BatchOutcome;

/// Configuration for the writer daemon.
#[derive(Clone)]
pub struct WriterConfig {
    /// Hive account the operations are published under.
    pub server_account: String,
    /// WIF posting keys for `server_account`.
    pub posting_keys: Vec<String>,
    /// Source of tunable settings snapshots.
    pub settings: Arc<SettingsManager>,
    /// Default medium tag for published batches.
    pub medium: Medium,
    /// Default reason tag for published batches.
    pub reason: Reason,
    /// Address the ingestion endpoint binds.
    pub listen_ip: IpAddr,
    /// Port the ingestion endpoint binds; `0` picks a free port.
    pub listen_port: u16,
    /// Operation-id prefix for published operations.
    pub operation_id: String,
    /// RPC nodes for the ring; the built-in node set is used when empty.
    pub nodes: Vec<Url>,
    /// Probe resource credits and publish startup notices at boot.
    pub resource_test: bool,
    /// Construct and validate operations without broadcasting.
    pub dry_run: bool,
    /// Run the ingest/coalesce/submit loops.
    pub daemon: bool,
    /// Run the periodic status reporter and authorization re-check.
    pub status: bool,
    /// Cap on publish attempts per batch; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl WriterConfig {
    /// Default operation-id prefix.
    pub const DEFAULT_OPERATION_ID: &'static str = "pp";
    /// Default ingestion endpoint port.
    pub const DEFAULT_LISTEN_PORT: u16 = 9999;

    /// A daemon configuration with conventional defaults.
    pub fn new(server_account: impl Into<String>) -> Self {
        Self {
            server_account: server_account.into(),
            posting_keys: Vec::new(),
            settings: Arc::new(SettingsManager::default()),
            medium: Medium::Podcast,
            reason: Reason::Update,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: Self::DEFAULT_LISTEN_PORT,
            operation_id: Self::DEFAULT_OPERATION_ID.to_string(),
            nodes: Vec::new(),
            resource_test: true,
            dry_run: false,
            daemon: true,
            status: true,
            max_attempts: None,
        }
    }
}

/// Terminal writer failures, mapped to process exit codes by the binary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriterError {
    /// A posting key failed to load or the chain rejected our posting
    /// authority.
    #[error("invalid posting key: {0}")]
    InvalidPostingKey(String),
    /// The startup probe failed for any other reason.
    #[error("startup failed: {0}")]
    StartupFailed(String),
    /// A one-shot publish could not deliver its IRIs.
    #[error("publish failed: {0}")]
    Publish(String),
    /// A supervised task died or exited unexpectedly.
    #[error("writer task failed: {0}")]
    Task(String),
}

/// Monotone counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// IRIs accepted by the ingestion endpoint.
    pub total_iris_recv: u64,
    /// Distinct IRIs that entered a batch.
    pub total_iris_recv_deduped: u64,
    /// IRIs successfully published (or dry-run validated).
    pub total_iris_sent: u64,
    /// IRIs accepted but not yet retired with their batch.
    pub iris_in_flight: i64,
}

/// Handle to a running writer instance.
pub struct WriterHandle {
    pub(crate) inner: Arc<crate::engine::WriterInner>,
    pub(crate) join: tokio::task::JoinHandle<Result<(), WriterError>>,
}

/// Detached stop trigger for a running writer, usable while the handle's
/// `join` future is being polled.
#[derive(Clone)]
pub struct WriterStopper {
    inner: Arc<crate::engine::WriterInner>,
}

impl WriterStopper {
    /// Request a graceful shutdown of the writer this came from.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }
}

impl WriterHandle {
    /// Request a graceful shutdown: stop accepting IRIs, flush the current
    /// window, and drain queued batches.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// A detached stop trigger for this writer.
    pub fn stopper(&self) -> WriterStopper {
        WriterStopper {
            inner: self.inner.clone(),
        }
    }

    /// Snapshot the writer counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters_snapshot()
    }

    /// Wait for the ingestion endpoint to bind and return its address.
    /// Returns `None` when the endpoint never comes up (non-daemon mode or
    /// early shutdown).
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut bound = self.inner.bound_addr();
        match bound.wait_for(|addr| addr.is_some()).await {
            Ok(addr) => *addr,
            Err(_) => None,
        }
    }

    /// Publish one set of IRIs through the retry pipeline, outside the
    /// batching queues. Waits for the startup gate like any batch. Returns
    /// the number of failed attempts before success.
    pub async fn publish_iris(
        &self,
        iris: HashSet<String>,
        medium: Medium,
        reason: Reason,
    ) -> Result<u32, WriterError> {
        if !self.inner.wait_startup_ready().await {
            return Err(WriterError::StartupFailed(
                "startup did not complete".to_string(),
            ));
        }
        match crate::submitter::publish_with_retry(&self.inner, &iris, medium, reason).await? {
            BatchOutcome::Published { failures } => Ok(failures),
            BatchOutcome::Dropped => Err(WriterError::Publish(format!(
                "dropped batch of {} IRIs",
                iris.len()
            ))),
        }
    }

    /// Wait for the writer to finish. `Ok(())` is a clean shutdown; an error
    /// is a terminal failure the caller should map to an exit code.
    pub async fn join(&mut self) -> Result<(), WriterError> {
        match (&mut self.join).await {
            Ok(result) => result,
            Err(err) => Err(WriterError::Task(format!("writer join error: {err}"))),
        }
    }
}

/// Start a writer against the real Hive chain client.
pub fn start_writer(config: WriterConfig) -> Result<WriterHandle, WriterError> {
    if !config.dry_run && config.posting_keys.is_empty() {
        return Err(WriterError::InvalidPostingKey(
            "no posting key configured".to_string(),
        ));
    }
    let nodes = if config.nodes.is_empty() {
        crate::hive::default_nodes()
    } else {
        config.nodes.clone()
    };
    let chain = HiveRpc::new(nodes, &config.posting_keys).map_err(|err| match err {
        ChainError::BadKey(message) => WriterError::InvalidPostingKey(message),
        other => WriterError::StartupFailed(other.to_string()),
    })?;
    Ok(crate::engine::start(config, Arc::new(chain)))
}
