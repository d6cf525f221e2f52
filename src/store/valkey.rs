//! Valkey (Redis-compatible) baseline store.
//!
//! Data model:
//!   network:epoch            → last publicly reported epoch (u64 string)
//!   whale                    → HASH identity → stake at last whale alert
//!   users                    → SET of user ids with at least one subscription
//!   sub:{user_id}:limits     → HASH identity → skip alert limit
//!   sub:{user_id}:state      → HASH identity → JSON NotifiedState
//!
//! The limits hash is the source of truth for "subscription exists"; the
//! state hash only carries the engine's dedup baseline. Every operation
//! that touches more than one of these keys runs as a single script.
//!
//! The connection is opened on first use and dropped after a transport
//! error, so an outage surfaces as `StoreError` on each call and the store
//! picks up again once Valkey is back.

use super::{BaselineCommit, BaselineStore, NotifiedState, StoreError, Subscription};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, AsyncConnectionConfig, Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Write a subscription's state only while the subscription still exists.
/// KEYS[1] = limits hash, KEYS[2] = state hash, ARGV[1] = identity, ARGV[2] = JSON
const UPDATE_STATE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
  return 1
end
return 0
"#;

/// Insert-or-ignore a subscription. A fresh row drops any leftover state.
/// The users set is (re)added either way.
/// KEYS[1] = limits, KEYS[2] = state, KEYS[3] = users
/// ARGV[1] = identity, ARGV[2] = default limit, ARGV[3] = user id
const SUBSCRIBE_SCRIPT: &str = r#"
local inserted = redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2])
if inserted == 1 then
  redis.call('HDEL', KEYS[2], ARGV[1])
end
redis.call('SADD', KEYS[3], ARGV[3])
return inserted
"#;

/// Delete-if-exists; the user leaves the users set with their last row.
/// KEYS[1] = limits, KEYS[2] = state, KEYS[3] = users
/// ARGV[1] = identity, ARGV[2] = user id
const UNSUBSCRIBE_SCRIPT: &str = r#"
local removed = redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if redis.call('HLEN', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[3], ARGV[2])
end
return removed
"#;

/// Overwrite the limit of every existing row, never adding one.
/// KEYS[1] = limits, ARGV[1] = limit
const SET_LIMIT_SCRIPT: &str = r#"
local fields = redis.call('HKEYS', KEYS[1])
for _, field in ipairs(fields) do
  redis.call('HSET', KEYS[1], field, ARGV[1])
end
return #fields
"#;

/// Valkey-backed store.
///
/// All keys are namespaced under a configurable prefix so several
/// deployments can share one Valkey. Default prefix: "valwatch".
pub struct ValkeyStore {
    client: Client,
    timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
    prefix: String,
    default_skip_limit: u64,
}

impl ValkeyStore {
    /// Validate the URL. No connection is made until the first command.
    pub fn open(
        url: &str,
        prefix: &str,
        timeout: Duration,
        default_skip_limit: u64,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            timeout,
            conn: Mutex::new(None),
            prefix: prefix.to_string(),
            default_skip_limit,
        })
    }

    /// Shared connection, opened on demand. Every command is bounded by
    /// the configured timeout.
    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(self.timeout)
            .set_response_timeout(self.timeout);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        info!(prefix = %self.prefix, "connected to Valkey");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Pass a command result through, dropping the connection if the
    /// transport broke so the next call reconnects.
    async fn checked<T>(&self, result: Result<T, RedisError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                warn!(error = %e, "Valkey connection lost, will reconnect");
                *self.conn.lock().await = None;
            }
        }
        Ok(result?)
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn limits_key(&self, user_id: &str) -> String {
        self.key(&format!("sub:{}:limits", user_id))
    }

    fn state_key(&self, user_id: &str) -> String {
        self.key(&format!("sub:{}:state", user_id))
    }

    fn parse_limit(&self, user_id: &str, identity: &str, raw: &str) -> u64 {
        raw.parse().unwrap_or_else(|_| {
            warn!(
                user_id = user_id,
                identity = identity,
                raw = raw,
                "unreadable skip limit, using default"
            );
            self.default_skip_limit
        })
    }
}

#[async_trait]
impl BaselineStore for ValkeyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let pong: String = self.checked(redis::cmd("PING").query_async(&mut conn).await).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    async fn network_epoch(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = self.checked(conn.get(self.key("network:epoch")).await).await?;
        Ok(raw.and_then(|r| r.parse().ok()).unwrap_or(0))
    }

    async fn whale_baselines(&self) -> Result<HashMap<String, u64>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, String> = self.checked(conn.hgetall(self.key("whale")).await).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(identity, stake)| match stake.parse() {
                Ok(s) => Some((identity, s)),
                Err(_) => {
                    // Dropping the row re-seeds it on the next cycle.
                    warn!(identity = %identity, raw = %stake, "unreadable whale baseline");
                    None
                }
            })
            .collect())
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.conn().await?;
        let mut users: Vec<String> = self.checked(conn.smembers(self.key("users")).await).await?;
        users.sort();

        let mut subs = Vec::new();
        for user_id in users {
            subs.extend(self.subscriptions_for(&user_id).await?);
        }
        Ok(subs)
    }

    async fn subscriptions_for(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.conn().await?;
        let limits: HashMap<String, String> =
            self.checked(conn.hgetall(self.limits_key(user_id)).await).await?;
        if limits.is_empty() {
            return Ok(Vec::new());
        }
        let states: HashMap<String, String> =
            self.checked(conn.hgetall(self.state_key(user_id)).await).await?;

        let mut subs: Vec<Subscription> = limits
            .into_iter()
            .map(|(identity, raw_limit)| {
                let skip_alert_limit = self.parse_limit(user_id, &identity, &raw_limit);
                let last_notified = states
                    .get(&identity)
                    .map(|raw| NotifiedState::decode(raw))
                    .unwrap_or_default();
                Subscription {
                    user_id: user_id.to_string(),
                    identity,
                    skip_alert_limit,
                    last_notified,
                }
            })
            .collect();
        subs.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(subs)
    }

    async fn subscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let inserted: i64 = self
            .checked(
                Script::new(SUBSCRIBE_SCRIPT)
                    .key(self.limits_key(user_id))
                    .key(self.state_key(user_id))
                    .key(self.key("users"))
                    .arg(identity)
                    .arg(self.default_skip_limit)
                    .arg(user_id)
                    .invoke_async(&mut conn)
                    .await,
            )
            .await?;
        if inserted == 1 {
            info!(user_id = user_id, identity = identity, "subscription added");
        }
        Ok(inserted == 1)
    }

    async fn unsubscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .checked(
                Script::new(UNSUBSCRIBE_SCRIPT)
                    .key(self.limits_key(user_id))
                    .key(self.state_key(user_id))
                    .key(self.key("users"))
                    .arg(identity)
                    .arg(user_id)
                    .invoke_async(&mut conn)
                    .await,
            )
            .await?;
        if removed > 0 {
            info!(user_id = user_id, identity = identity, "subscription removed");
        }
        Ok(removed > 0)
    }

    async fn set_skip_limit(&self, user_id: &str, limit: u64) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let touched: usize = self
            .checked(
                Script::new(SET_LIMIT_SCRIPT)
                    .key(self.limits_key(user_id))
                    .arg(limit)
                    .invoke_async(&mut conn)
                    .await,
            )
            .await?;
        debug!(user_id = user_id, limit, touched, "skip limit updated");
        Ok(touched)
    }

    async fn commit(&self, commit: &BaselineCommit) -> Result<(), StoreError> {
        if commit.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        if let Some(epoch) = commit.network_epoch {
            pipe.set(self.key("network:epoch"), epoch).ignore();
        }
        if !commit.whale_stakes.is_empty() {
            pipe.hset_multiple(self.key("whale"), &commit.whale_stakes).ignore();
        }
        for update in &commit.subscriptions {
            let json = serde_json::to_string(&update.state)?;
            pipe.cmd("EVAL")
                .arg(UPDATE_STATE_SCRIPT)
                .arg(2)
                .arg(self.limits_key(&update.user_id))
                .arg(self.state_key(&update.user_id))
                .arg(&update.identity)
                .arg(json)
                .ignore();
        }

        let mut conn = self.conn().await?;
        let _: () = self.checked(pipe.query_async(&mut conn).await).await?;
        debug!(
            epoch = ?commit.network_epoch,
            whales = commit.whale_stakes.len(),
            subscriptions = commit.subscriptions.len(),
            "baselines committed"
        );
        Ok(())
    }
}
