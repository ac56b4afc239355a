//! The Hive chain client: a rotating node ring and a JSON-RPC client for the
//! capabilities the pipeline consumes (broadcast, resource credits, allowed
//! accounts, node ranking).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Url;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::publisher::CustomJsonOperation;
use crate::sign::{self, WifKey};

/// Well-known public Hive API endpoints, used when no nodes are configured.
pub(crate) const DEFAULT_NODES: &[&str] = &[
    "https://api.hive.blog",
    "https://api.deathwing.me",
    "https://hive-api.arcange.eu",
    "https://api.openhive.network",
    "https://techcoderx.com",
];

/// The built-in node ring.
pub(crate) fn default_nodes() -> Vec<Url> {
    DEFAULT_NODES
        .iter()
        .map(|node| Url::parse(node).expect("DEFAULT_NODES must be valid URLs"))
        .collect()
}

/// Seconds for an account's resource-credit bar to regenerate from empty.
const RC_REGEN_SECONDS: i64 = 5 * 24 * 60 * 60;

/// Timeout for a single node-latency probe during ranking.
const RANK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by the chain client.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ChainError {
    /// A posting key could not be decoded.
    #[error("error loading base58 posting key: {0}")]
    BadKey(String),
    /// The node answered with a JSON-RPC error object.
    #[error("rpc error from {node}: {message}")]
    Rpc {
        /// Node that produced the error.
        node: String,
        /// Human-readable error message from the node.
        message: String,
        /// Structured error name (`error.data.name`) when the node sent one.
        data_name: Option<String>,
    },
    /// The request never produced a JSON-RPC response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response did not have the expected shape.
    #[error("unexpected rpc response: {0}")]
    Protocol(String),
}

/// Resource-credit snapshot for an account, regenerated to "now".
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Manabar {
    pub(crate) last_mana: f64,
    pub(crate) last_mana_percent: f64,
    pub(crate) max_mana: f64,
}

/// Capabilities of the chain consumed by the pipeline.
///
/// Production uses [`HiveRpc`]; tests substitute a scripted mock.
#[async_trait]
pub(crate) trait Chain: Send + Sync {
    /// Broadcast one `custom_json` operation through the current node.
    async fn broadcast(&self, op: &CustomJsonOperation) -> Result<(), ChainError>;

    /// Read the signing account's resource-credit snapshot.
    async fn resource_credits(&self, account: &str) -> Result<Manabar, ChainError>;

    /// Estimate the resource-credit cost of one operation.
    async fn rc_cost(&self, op: &CustomJsonOperation) -> Result<f64, ChainError>;

    /// Fetch the set of accounts allowed to publish podpings.
    async fn allowed_accounts(&self, control_account: &str) -> Result<HashSet<String>, ChainError>;

    /// Re-rank the node ring by responsiveness and reset the cursor to the
    /// fastest node. Failures keep the previous ring and are only logged.
    async fn rank_nodes(&self);

    /// Rotate the node ring to the next node.
    fn advance_node(&self);

    /// The node the next request will use.
    fn current_node(&self) -> Url;
}

/// Cyclic sequence of RPC endpoints with a rotating cursor.
///
/// Concurrent `advance` calls are fine; the cursor only needs to eventually
/// rotate. `replace` swaps the whole sequence and resets the cursor.
pub(crate) struct NodeRing {
    nodes: RwLock<Vec<Url>>,
    cursor: AtomicUsize,
}

impl NodeRing {
    pub(crate) fn new(nodes: Vec<Url>) -> Self {
        debug_assert!(!nodes.is_empty());
        Self {
            nodes: RwLock::new(nodes),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current(&self) -> Url {
        let nodes = self.nodes.read();
        nodes[self.cursor.load(Ordering::Relaxed) % nodes.len()].clone()
    }

    pub(crate) fn advance(&self) -> Url {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let nodes = self.nodes.read();
        nodes[next % nodes.len()].clone()
    }

    pub(crate) fn replace(&self, ranked: Vec<Url>) {
        if ranked.is_empty() {
            return;
        }
        *self.nodes.write() = ranked;
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Vec<Url> {
        self.nodes.read().clone()
    }
}

/// JSON-RPC client for Hive API nodes.
pub(crate) struct HiveRpc {
    http: reqwest::Client,
    ring: NodeRing,
    keys: Vec<WifKey>,
}

impl HiveRpc {
    pub(crate) fn new(nodes: Vec<Url>, posting_keys: &[String]) -> Result<Self, ChainError> {
        let keys = posting_keys
            .iter()
            .map(|wif| WifKey::from_wif(wif))
            .collect::<Result<Vec<_>, _>>()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            ring: NodeRing::new(nodes),
            keys,
        })
    }

    async fn call(
        &self,
        node: &Url,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self.http.post(node.clone()).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ChainError::Protocol(format!(
                "http {} from {node}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        if let Some(error) = body.get("error") {
            return Err(parse_rpc_error(node, error));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| ChainError::Protocol(format!("missing result from {node}")))
    }
}

/// Turn a JSON-RPC `error` object into a [`ChainError::Rpc`], keeping the
/// structured `data.name` for classification when the node provides it.
pub(crate) fn parse_rpc_error(node: &Url, error: &serde_json::Value) -> ChainError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown rpc error")
        .to_string();
    let data_name = error
        .pointer("/data/name")
        .and_then(|n| n.as_str())
        .map(str::to_string);
    ChainError::Rpc {
        node: node.to_string(),
        message,
        data_name,
    }
}

fn as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Linear 5-day regeneration of an account's mana towards `max_mana`.
pub(crate) fn regenerate_manabar(
    current_mana: f64,
    max_mana: f64,
    last_update_time: i64,
    now: i64,
) -> Manabar {
    let elapsed = (now - last_update_time).max(0) as f64;
    let regenerated = max_mana * elapsed / RC_REGEN_SECONDS as f64;
    let last_mana = (current_mana + regenerated).min(max_mana);
    let last_mana_percent = if max_mana > 0.0 {
        100.0 * last_mana / max_mana
    } else {
        0.0
    };
    Manabar {
        last_mana,
        last_mana_percent,
        max_mana,
    }
}

#[async_trait]
impl Chain for HiveRpc {
    async fn broadcast(&self, op: &CustomJsonOperation) -> Result<(), ChainError> {
        let key = self
            .keys
            .first()
            .ok_or_else(|| ChainError::BadKey("no posting key configured".to_string()))?;
        let node = self.ring.current();
        let props = self
            .call(&node, "condenser_api.get_dynamic_global_properties", json!([]))
            .await?;
        let ref_block = sign::ref_block_from_props(&props)?;
        let trx = sign::signed_transaction_json(key, &ref_block, op)?;
        self.call(&node, "network_broadcast_api.broadcast_transaction", json!({ "trx": trx }))
            .await?;
        Ok(())
    }

    async fn resource_credits(&self, account: &str) -> Result<Manabar, ChainError> {
        let node = self.ring.current();
        let result = self
            .call(&node, "rc_api.find_rc_accounts", json!({ "accounts": [account] }))
            .await?;
        let rc_account = result
            .pointer("/rc_accounts/0")
            .ok_or_else(|| ChainError::Protocol(format!("no rc account for {account}")))?;
        let current_mana = rc_account
            .pointer("/rc_manabar/current_mana")
            .and_then(as_f64)
            .ok_or_else(|| ChainError::Protocol("missing rc_manabar.current_mana".to_string()))?;
        let last_update_time = rc_account
            .pointer("/rc_manabar/last_update_time")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ChainError::Protocol("missing rc_manabar.last_update_time".to_string()))?;
        let max_mana = rc_account
            .get("max_rc")
            .and_then(as_f64)
            .ok_or_else(|| ChainError::Protocol("missing max_rc".to_string()))?;
        Ok(regenerate_manabar(
            current_mana,
            max_mana,
            last_update_time,
            Utc::now().timestamp(),
        ))
    }

    async fn rc_cost(&self, op: &CustomJsonOperation) -> Result<f64, ChainError> {
        let node = self.ring.current();
        let params = self
            .call(&node, "rc_api.get_resource_params", json!({}))
            .await?;
        let pool = self
            .call(&node, "rc_api.get_resource_pool", json!({}))
            .await?;

        // History bytes dominate the cost of a custom_json; price the
        // serialized operation against the published pool curve.
        let curve = params
            .pointer("/resource_params/resource_history_bytes/price_curve_params")
            .ok_or_else(|| ChainError::Protocol("missing history-bytes price curve".to_string()))?;
        let coeff_a = curve
            .get("coeff_a")
            .and_then(as_f64)
            .ok_or_else(|| ChainError::Protocol("missing coeff_a".to_string()))?;
        let coeff_b = curve
            .get("coeff_b")
            .and_then(as_f64)
            .ok_or_else(|| ChainError::Protocol("missing coeff_b".to_string()))?;
        let shift = curve
            .get("shift")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ChainError::Protocol("missing shift".to_string()))?;
        let pool_size = pool
            .pointer("/resource_pool/resource_history_bytes/pool")
            .and_then(as_f64)
            .ok_or_else(|| ChainError::Protocol("missing history-bytes pool".to_string()))?;

        let usage_bytes = (op.json.len() + op.id.len() + 64) as f64;
        let price_denominator = (pool_size / 2f64.powi(shift as i32)) + coeff_b;
        let cost = usage_bytes * coeff_a / price_denominator.max(1.0);
        Ok((cost / 1e6).max(1.0))
    }

    async fn allowed_accounts(&self, control_account: &str) -> Result<HashSet<String>, ChainError> {
        let node = self.ring.current();
        let result = self
            .call(
                &node,
                "condenser_api.get_following",
                json!([control_account, serde_json::Value::Null, "blog", 100]),
            )
            .await?;
        let entries = result
            .as_array()
            .ok_or_else(|| ChainError::Protocol("get_following did not return a list".to_string()))?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("following").and_then(|f| f.as_str()))
            .map(str::to_string)
            .collect())
    }

    async fn rank_nodes(&self) {
        let candidates = self.ring.snapshot();
        let mut probes = JoinSet::new();
        for node in candidates {
            let http = self.http.clone();
            probes.spawn(async move {
                let started = Instant::now();
                let body = json!({
                    "jsonrpc": "2.0",
                    "method": "condenser_api.get_dynamic_global_properties",
                    "params": [],
                    "id": 1,
                });
                let outcome = tokio::time::timeout(
                    RANK_PROBE_TIMEOUT,
                    http.post(node.clone()).json(&body).send(),
                )
                .await;
                let latency = match outcome {
                    Ok(Ok(response)) if response.status().is_success() => Some(started.elapsed()),
                    _ => None,
                };
                (node, latency)
            });
        }

        let mut reachable: Vec<(Url, Duration)> = Vec::new();
        let mut unreachable: Vec<Url> = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok((node, Some(latency))) => reachable.push((node, latency)),
                Ok((node, None)) => {
                    warn!(%node, "node unreachable during ranking");
                    unreachable.push(node);
                }
                Err(err) => warn!("rank probe task failed: {err}"),
            }
        }

        if reachable.is_empty() {
            warn!("no node answered the ranking probe; keeping current ring order");
            return;
        }

        reachable.sort_by_key(|(_, latency)| *latency);
        let mut ranked: Vec<Url> = reachable.into_iter().map(|(node, _)| node).collect();
        ranked.extend(unreachable);
        self.ring.replace(ranked);
        info!(node = %self.ring.current(), "node ring re-ranked");
    }

    fn advance_node(&self) {
        let node = self.ring.advance();
        debug!(%node, "advanced to next node");
    }

    fn current_node(&self) -> Url {
        self.ring.current()
    }
}
