//! Baseline and subscription persistence.
//!
//! Three logical tables back the alert engine:
//!   network cursor   → last epoch a public epoch report went out for
//!   whale baselines  → identity → stake at the last whale alert
//!   subscriptions    → (user, identity) → skip limit + last notified state
//!
//! The engine only talks to the `BaselineStore` trait. `ValkeyStore` is the
//! production backend, `MemoryStore` keeps everything in process.

pub mod memory;
pub mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use crate::config::StoreConfig;
use crate::snapshot::ValidatorStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The last state a subscriber was actually told about.
///
/// `None` fields mean "never observed": the first cycle seeds them without
/// alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedState {
    #[serde(default)]
    pub status: Option<ValidatorStatus>,
    #[serde(default)]
    pub commission: Option<u8>,
    #[serde(default)]
    pub notified_skip_count: u64,
    #[serde(default)]
    pub notified_epoch: u64,
}

impl NotifiedState {
    /// Decode a stored state. Anything unreadable counts as never notified.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "unreadable notified state, treating as empty");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub user_id: String,
    pub identity: String,
    pub skip_alert_limit: u64,
    pub last_notified: NotifiedState,
}

/// New last-notified state for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub user_id: String,
    pub identity: String,
    pub state: NotifiedState,
}

/// Every baseline write produced by one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineCommit {
    pub network_epoch: Option<u64>,
    /// identity → stake to record as the whale baseline
    pub whale_stakes: Vec<(String, u64)>,
    pub subscriptions: Vec<SubscriptionUpdate>,
}

impl BaselineCommit {
    pub fn is_empty(&self) -> bool {
        self.network_epoch.is_none() && self.whale_stakes.is_empty() && self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        usize::from(self.network_epoch.is_some()) + self.whale_stakes.len() + self.subscriptions.len()
    }
}

/// Storage contract for the alert engine and the command layer.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Last epoch reported publicly, 0 if never.
    async fn network_epoch(&self) -> Result<u64, StoreError>;

    async fn whale_baselines(&self) -> Result<HashMap<String, u64>, StoreError>;

    /// All subscriptions, ordered by (user, identity).
    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn subscriptions_for(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError>;

    /// Insert-or-ignore. Returns true if a new row was created.
    async fn subscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError>;

    /// Delete-if-exists. Returns true if a row was removed.
    async fn unsubscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError>;

    /// Set the skip alert limit on every subscription of `user_id`.
    /// Returns the number of rows touched.
    async fn set_skip_limit(&self, user_id: &str, limit: u64) -> Result<usize, StoreError>;

    /// Apply one cycle's writes as a single batch. Updates for
    /// subscriptions removed in the meantime are dropped.
    async fn commit(&self, commit: &BaselineCommit) -> Result<(), StoreError>;
}

/// Build the configured store.
///
/// An empty URL selects the in-memory store. Otherwise the Valkey store is
/// used even if it cannot be reached right now: cycles then fail on the
/// store and health turns degraded, instead of silently running on state
/// that a restart would lose.
pub async fn open_store(
    config: &StoreConfig,
    default_skip_limit: u64,
) -> Result<Arc<dyn BaselineStore>, StoreError> {
    if config.url.is_empty() {
        warn!("no store url configured, baselines kept in memory and lost on restart");
        return Ok(Arc::new(MemoryStore::new(default_skip_limit)));
    }

    let store = ValkeyStore::open(
        &config.url,
        &config.prefix,
        Duration::from_millis(config.timeout_ms),
        default_skip_limit,
    )?;
    match store.ping().await {
        Ok(()) => info!(url = %config.url, "Valkey baseline store connected"),
        Err(e) => error!(
            error = %e,
            url = %config.url,
            "Valkey unreachable at startup, cycles will report store failures until it recovers"
        ),
    }
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_config(url: &str) -> StoreConfig {
        StoreConfig {
            url: url.to_string(),
            prefix: "test".to_string(),
            timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_empty_url_selects_memory_store() {
        let store = open_store(&store_config(""), 1).await.unwrap();
        assert!(store.ping().await.is_ok());
        assert!(store.subscribe("u1", "V1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_valkey_is_kept_not_replaced() {
        let store = open_store(&store_config("redis://127.0.0.1:1"), 1).await.unwrap();
        assert!(store.ping().await.is_err());
        assert!(store.network_epoch().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_url_is_fatal() {
        assert!(open_store(&store_config("nope"), 1).await.is_err());
    }

    #[test]
    fn test_decode_round_trip() {
        let state = NotifiedState {
            status: Some(ValidatorStatus::Delinquent),
            commission: Some(8),
            notified_skip_count: 4,
            notified_epoch: 12,
        };
        let raw = serde_json::to_string(&state).unwrap();
        assert_eq!(NotifiedState::decode(&raw), state);
    }

    #[test]
    fn test_malformed_state_is_empty() {
        assert_eq!(NotifiedState::decode("{oops"), NotifiedState::default());
        assert_eq!(NotifiedState::decode(""), NotifiedState::default());
        // Legacy blobs with unknown keys decode to an empty baseline too.
        assert_eq!(
            NotifiedState::decode(r#"{"comm": 5, "notified_skip": 3}"#),
            NotifiedState::default()
        );
    }

    #[test]
    fn test_commit_len() {
        let mut commit = BaselineCommit::default();
        assert!(commit.is_empty());
        commit.network_epoch = Some(3);
        commit.whale_stakes.push(("A".to_string(), 1));
        assert_eq!(commit.len(), 2);
        assert!(!commit.is_empty());
    }
}
