//! Scripted chain client and config helpers shared by the engine tests.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::watch;

use podping_writer_core::settings::{PodpingSettings, SettingsManager};

use crate::api::WriterConfig;
use crate::engine::WriterInner;
use crate::hive::{Chain, ChainError, Manabar, NodeRing};
use crate::publisher::CustomJsonOperation;

type ErrorFactory = Box<dyn Fn() -> ChainError + Send + Sync>;

/// A chain client with scripted failures and observable side effects.
pub(crate) struct MockChain {
    pub(crate) ring: NodeRing,
    pub(crate) broadcasts: Mutex<Vec<CustomJsonOperation>>,
    pub(crate) advances: AtomicUsize,
    pub(crate) rank_calls: AtomicUsize,
    pub(crate) resource_credit_calls: AtomicUsize,
    pub(crate) allowed: Mutex<HashSet<String>>,
    scripted_errors: Mutex<VecDeque<ChainError>>,
    persistent_error: Mutex<Option<ErrorFactory>>,
    allowed_accounts_fail: AtomicBool,
}

impl MockChain {
    pub(crate) fn new() -> Self {
        let nodes = vec![
            Url::parse("https://a.example").unwrap(),
            Url::parse("https://b.example").unwrap(),
            Url::parse("https://c.example").unwrap(),
        ];
        Self {
            ring: NodeRing::new(nodes),
            broadcasts: Mutex::new(Vec::new()),
            advances: AtomicUsize::new(0),
            rank_calls: AtomicUsize::new(0),
            resource_credit_calls: AtomicUsize::new(0),
            allowed: Mutex::new(HashSet::from(["podping.test".to_string()])),
            scripted_errors: Mutex::new(VecDeque::new()),
            persistent_error: Mutex::new(None),
            allowed_accounts_fail: AtomicBool::new(false),
        }
    }

    /// Queue one broadcast failure; scripted failures are consumed in order
    /// before broadcasts start succeeding again.
    pub(crate) fn push_broadcast_error(&self, err: ChainError) {
        self.scripted_errors.lock().push_back(err);
    }

    /// Fail every broadcast from now on.
    pub(crate) fn fail_broadcasts_forever(
        &self,
        factory: impl Fn() -> ChainError + Send + Sync + 'static,
    ) {
        *self.persistent_error.lock() = Some(Box::new(factory));
    }

    /// Fail allowed-account lookups.
    pub(crate) fn fail_allowed_accounts(&self) {
        self.allowed_accounts_fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Chain for MockChain {
    async fn broadcast(&self, op: &CustomJsonOperation) -> Result<(), ChainError> {
        if let Some(err) = self.scripted_errors.lock().pop_front() {
            return Err(err);
        }
        if let Some(factory) = self.persistent_error.lock().as_ref() {
            return Err(factory());
        }
        self.broadcasts.lock().push(op.clone());
        Ok(())
    }

    async fn resource_credits(&self, _account: &str) -> Result<Manabar, ChainError> {
        self.resource_credit_calls.fetch_add(1, Ordering::Relaxed);
        Ok(Manabar {
            last_mana: 9.5e11,
            last_mana_percent: 95.0,
            max_mana: 1e12,
        })
    }

    async fn rc_cost(&self, _op: &CustomJsonOperation) -> Result<f64, ChainError> {
        Ok(5.0)
    }

    async fn allowed_accounts(&self, _control_account: &str) -> Result<HashSet<String>, ChainError> {
        if self.allowed_accounts_fail.load(Ordering::SeqCst) {
            return Err(ChainError::Protocol("allowed-account lookup failed".to_string()));
        }
        Ok(self.allowed.lock().clone())
    }

    async fn rank_nodes(&self) {
        self.rank_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn advance_node(&self) {
        self.advances.fetch_add(1, Ordering::Relaxed);
        self.ring.advance();
    }

    fn current_node(&self) -> Url {
        self.ring.current()
    }
}

/// A daemon config tuned for fast tests: one-second windows and re-checks,
/// a free port, and no resource probe.
pub(crate) fn test_config() -> WriterConfig {
    let mut config = WriterConfig::new("podping.test");
    config.settings = Arc::new(SettingsManager::new(PodpingSettings {
        hive_operation_period: 1,
        diagnostic_report_period: 1,
        control_account_check_period: 1,
        ..PodpingSettings::default()
    }));
    config.listen_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.listen_port = 0;
    config.resource_test = false;
    config.status = false;
    config
}

/// Build a [`WriterInner`] without spawning the runtime.
pub(crate) fn test_inner(config: WriterConfig, chain: Arc<MockChain>) -> Arc<WriterInner> {
    let (_bound_tx, bound_rx) = watch::channel(None);
    WriterInner::new(config, chain, bound_rx)
}
