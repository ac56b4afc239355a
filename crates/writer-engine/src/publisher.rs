//! Operation construction and broadcast: wraps a payload document as a
//! `custom_json` operation, enforces the chain's payload bound, and
//! classifies broadcast failures for the submitter's retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use podping_writer_core::podping::{HiveOperationId, Medium, Podping, Reason};

use crate::engine::Counters;
use crate::hive::{Chain, ChainError};

/// Hard chain-side bound on a `custom_json` payload, in bytes.
pub(crate) const HIVE_CUSTOM_OP_DATA_MAX_LENGTH: usize = 8192;

/// Fallback classifier for the per-block custom_json quota; the node phrases
/// this as a plugin exception rather than a structured error name.
static CUSTOM_JSON_QUOTA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"plugin exception.*custom json.*").expect("static regex"));

/// A `custom_json` operation ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct CustomJsonOperation {
    pub(crate) required_auths: Vec<String>,
    pub(crate) required_posting_auths: Vec<String>,
    pub(crate) id: String,
    pub(crate) json: String,
}

/// Failures while constructing or broadcasting one operation.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PublishError {
    /// The serialized payload exceeds the chain's bound; retrying cannot help.
    #[error("max custom_json payload exceeded ({size} bytes)")]
    PayloadExceeded {
        /// Serialized payload size in bytes.
        size: usize,
    },
    /// The payload document could not be serialized; retrying cannot help.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The chain limits custom_json operations per account per block;
    /// transient, retry on the next node.
    #[error("too many custom_json operations for @{account} in this block")]
    TooManyCustomJsonsPerBlock {
        /// Publishing account that hit the quota.
        account: String,
    },
    /// The chain rejected our posting authority; fatal for the process.
    #[error("missing posting authority for @{account}")]
    MissingPostingAuth {
        /// Publishing account missing the authority.
        account: String,
    },
    /// Any other chain failure; transient.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl PublishError {
    /// Construction failures that no amount of retrying can fix.
    pub(crate) fn is_unretryable(&self) -> bool {
        matches!(
            self,
            PublishError::PayloadExceeded { .. } | PublishError::Serialize(_)
        )
    }
}

/// Builds and broadcasts podping operations for one configured account.
pub(crate) struct Publisher {
    chain: Arc<dyn Chain>,
    counters: Arc<Counters>,
    server_account: String,
    operation_id: String,
    dry_run: bool,
}

impl Publisher {
    pub(crate) fn new(
        chain: Arc<dyn Chain>,
        counters: Arc<Counters>,
        server_account: String,
        operation_id: String,
        dry_run: bool,
    ) -> Self {
        Self {
            chain,
            counters,
            server_account,
            operation_id,
            dry_run,
        }
    }

    pub(crate) fn operation_id_prefix(&self) -> &str {
        &self.operation_id
    }

    /// Wrap `payload` as a size-checked `custom_json` operation.
    pub(crate) fn construct_operation(
        &self,
        payload: &serde_json::Value,
        operation_id: &str,
    ) -> Result<CustomJsonOperation, PublishError> {
        let payload_json = serde_json::to_string(payload)?;
        let size = payload_json.len();
        if size > HIVE_CUSTOM_OP_DATA_MAX_LENGTH {
            return Err(PublishError::PayloadExceeded { size });
        }
        Ok(CustomJsonOperation {
            required_auths: Vec::new(),
            required_posting_auths: vec![self.server_account.clone()],
            id: operation_id.to_string(),
            json: payload_json,
        })
    }

    /// Construct and broadcast one operation. Dry runs stop after
    /// construction and validation.
    pub(crate) async fn send_notification(
        &self,
        payload: &serde_json::Value,
        operation_id: &str,
    ) -> Result<(), PublishError> {
        let op = self.construct_operation(payload, operation_id)?;
        let size = op.json.len();

        if self.dry_run {
            debug!(%operation_id, size, "dry run, skipping broadcast");
            return Ok(());
        }

        match self.chain.broadcast(&op).await {
            Ok(()) => {
                info!(node = %self.chain.current_node(), %operation_id, size, "operation broadcast");
                Ok(())
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Publish one batch of IRIs and bump the sent counter on success.
    pub(crate) async fn send_notification_iris(
        &self,
        iris: &HashSet<String>,
        medium: Medium,
        reason: Reason,
    ) -> Result<(), PublishError> {
        let payload = Podping::new(medium, reason, iris.iter().cloned());
        let operation_id = HiveOperationId::new(self.operation_id.clone(), medium, reason);
        let value = serde_json::to_value(&payload)?;
        self.send_notification(&value, &operation_id.to_string())
            .await?;
        self.counters
            .total_iris_sent
            .fetch_add(iris.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Map a chain failure onto the retry policy. The structured error name
    /// is authoritative; the quota regex is the fallback classifier.
    fn classify(&self, err: ChainError) -> PublishError {
        if let ChainError::Rpc {
            ref message,
            ref data_name,
            ..
        } = err
        {
            if data_name.as_deref() == Some("tx_missing_posting_auth") {
                return PublishError::MissingPostingAuth {
                    account: self.server_account.clone(),
                };
            }
            if CUSTOM_JSON_QUOTA_RE.is_match(message) {
                self.chain.advance_node();
                return PublishError::TooManyCustomJsonsPerBlock {
                    account: self.server_account.clone(),
                };
            }
        }
        PublishError::Chain(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use podping_writer_core::podping::StartupNotice;
    use std::sync::atomic::Ordering;

    fn publisher(chain: Arc<MockChain>, dry_run: bool) -> Publisher {
        Publisher::new(
            chain,
            Arc::new(Counters::default()),
            "podping.test".to_string(),
            "pp".to_string(),
            dry_run,
        )
    }

    #[test]
    fn constructed_operation_uses_compact_json() {
        let publisher = publisher(Arc::new(MockChain::new()), true);
        let payload = serde_json::to_value(Podping::new(
            Medium::Podcast,
            Reason::Update,
            ["https://example.com/feed.xml".to_string()],
        ))
        .unwrap();

        let op = publisher.construct_operation(&payload, "pp_podcast_update").unwrap();
        assert!(!op.json.contains(": "));
        assert!(!op.json.contains(", "));
        assert!(op.required_auths.is_empty());
        assert_eq!(op.required_posting_auths, vec!["podping.test".to_string()]);
        assert_eq!(op.id, "pp_podcast_update");

        // Parsing the operation's json field yields the original document.
        let parsed: serde_json::Value = serde_json::from_str(&op.json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn startup_notice_round_trips_through_operation() {
        let publisher = publisher(Arc::new(MockChain::new()), true);
        let notice = StartupNotice::initiated("podping.test", "https://api.hive.blog/");
        let payload = serde_json::to_value(&notice).unwrap();

        let op = publisher.construct_operation(&payload, "pp_startup").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&op.json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn oversized_payload_is_rejected_before_broadcast() {
        let publisher = publisher(Arc::new(MockChain::new()), true);
        let huge = "x".repeat(HIVE_CUSTOM_OP_DATA_MAX_LENGTH);
        let payload = serde_json::json!({ "iris": [huge] });

        match publisher.construct_operation(&payload, "pp_podcast_update") {
            Err(PublishError::PayloadExceeded { size }) => {
                assert!(size > HIVE_CUSTOM_OP_DATA_MAX_LENGTH);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_counts_iris_without_broadcasting() {
        let chain = Arc::new(MockChain::new());
        let publisher = publisher(chain.clone(), true);
        let iris: HashSet<String> = ["https://example.com/feed.xml".to_string()].into();

        publisher
            .send_notification_iris(&iris, Medium::Podcast, Reason::Update)
            .await
            .unwrap();

        assert_eq!(publisher.counters.total_iris_sent.load(Ordering::Relaxed), 1);
        assert!(chain.broadcasts.lock().is_empty());
    }

    #[tokio::test]
    async fn quota_error_advances_node_and_is_transient() {
        let chain = Arc::new(MockChain::new());
        chain.push_broadcast_error(ChainError::Rpc {
            node: "https://a.example/".to_string(),
            message: "plugin exception: tried to use too many custom json operations".to_string(),
            data_name: None,
        });
        let publisher = publisher(chain.clone(), false);
        let iris: HashSet<String> = ["https://example.com/feed.xml".to_string()].into();

        let err = publisher
            .send_notification_iris(&iris, Medium::Podcast, Reason::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::TooManyCustomJsonsPerBlock { .. }));
        assert_eq!(chain.advances.load(Ordering::Relaxed), 1);
        assert_eq!(publisher.counters.total_iris_sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_posting_auth_is_classified_fatal() {
        let chain = Arc::new(MockChain::new());
        chain.push_broadcast_error(ChainError::Rpc {
            node: "https://a.example/".to_string(),
            message: "missing required posting authority".to_string(),
            data_name: Some("tx_missing_posting_auth".to_string()),
        });
        let publisher = publisher(chain.clone(), false);
        let iris: HashSet<String> = ["https://example.com/feed.xml".to_string()].into();

        let err = publisher
            .send_notification_iris(&iris, Medium::Podcast, Reason::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::MissingPostingAuth { .. }));
        assert_eq!(chain.advances.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn other_rpc_errors_stay_transient() {
        let chain = Arc::new(MockChain::new());
        chain.push_broadcast_error(ChainError::Protocol("connection reset".to_string()));
        let publisher = publisher(chain.clone(), false);
        let iris: HashSet<String> = ["https://example.com/feed.xml".to_string()].into();

        let err = publisher
            .send_notification_iris(&iris, Medium::Podcast, Reason::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Chain(_)));
        assert!(!err.is_unretryable());
    }
}
