//! In-process store. Nothing survives a restart; used when Valkey is not
//! reachable and in tests.

use super::{BaselineCommit, BaselineStore, NotifiedState, StoreError, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone)]
struct Row {
    skip_alert_limit: u64,
    last_notified: NotifiedState,
}

pub struct MemoryStore {
    default_skip_limit: u64,
    network_epoch: AtomicU64,
    whales: DashMap<String, u64>,
    /// (user_id, identity) → row
    subscriptions: DashMap<(String, String), Row>,
}

impl MemoryStore {
    pub fn new(default_skip_limit: u64) -> Self {
        Self {
            default_skip_limit,
            network_epoch: AtomicU64::new(0),
            whales: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    fn collect<F>(&self, keep: F) -> Vec<Subscription>
    where
        F: Fn(&(String, String)) -> bool,
    {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|entry| keep(entry.key()))
            .map(|entry| {
                let (user_id, identity) = entry.key().clone();
                Subscription {
                    user_id,
                    identity,
                    skip_alert_limit: entry.skip_alert_limit,
                    last_notified: entry.last_notified.clone(),
                }
            })
            .collect();
        subs.sort_by(|a, b| (&a.user_id, &a.identity).cmp(&(&b.user_id, &b.identity)));
        subs
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn network_epoch(&self) -> Result<u64, StoreError> {
        Ok(self.network_epoch.load(Ordering::SeqCst))
    }

    async fn whale_baselines(&self) -> Result<HashMap<String, u64>, StoreError> {
        Ok(self
            .whales
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect(|_| true))
    }

    async fn subscriptions_for(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.collect(|(user, _)| user == user_id))
    }

    async fn subscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError> {
        let key = (user_id.to_string(), identity.to_string());
        let mut inserted = false;
        self.subscriptions.entry(key).or_insert_with(|| {
            inserted = true;
            Row {
                skip_alert_limit: self.default_skip_limit,
                last_notified: NotifiedState::default(),
            }
        });
        Ok(inserted)
    }

    async fn unsubscribe(&self, user_id: &str, identity: &str) -> Result<bool, StoreError> {
        let key = (user_id.to_string(), identity.to_string());
        Ok(self.subscriptions.remove(&key).is_some())
    }

    async fn set_skip_limit(&self, user_id: &str, limit: u64) -> Result<usize, StoreError> {
        let mut touched = 0;
        for mut entry in self.subscriptions.iter_mut() {
            if entry.key().0 == user_id {
                entry.skip_alert_limit = limit;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn commit(&self, commit: &BaselineCommit) -> Result<(), StoreError> {
        if let Some(epoch) = commit.network_epoch {
            self.network_epoch.store(epoch, Ordering::SeqCst);
        }
        for (identity, stake) in &commit.whale_stakes {
            self.whales.insert(identity.clone(), *stake);
        }
        for update in &commit.subscriptions {
            let key = (update.user_id.clone(), update.identity.clone());
            if let Some(mut row) = self.subscriptions.get_mut(&key) {
                row.last_notified = update.state.clone();
            }
        }
        debug!(writes = commit.len(), "memory store commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ValidatorStatus;
    use crate::store::SubscriptionUpdate;

    #[tokio::test]
    async fn test_subscribe_is_insert_or_ignore() {
        let store = MemoryStore::new(1);
        assert!(store.subscribe("u1", "V1").await.unwrap());
        assert!(!store.subscribe("u1", "V1").await.unwrap());
        assert!(store.subscribe("u2", "V1").await.unwrap());

        let subs = store.subscriptions().await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].user_id, "u1");
        assert_eq!(subs[0].skip_alert_limit, 1);
        assert_eq!(subs[0].last_notified, NotifiedState::default());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_delete_if_exists() {
        let store = MemoryStore::new(1);
        store.subscribe("u1", "V1").await.unwrap();
        assert!(store.unsubscribe("u1", "V1").await.unwrap());
        assert!(!store.unsubscribe("u1", "V1").await.unwrap());
        assert!(store.subscriptions_for("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_skip_limit_applies_to_all_user_rows() {
        let store = MemoryStore::new(1);
        store.subscribe("u1", "V1").await.unwrap();
        store.subscribe("u1", "V2").await.unwrap();
        store.subscribe("u2", "V1").await.unwrap();

        assert_eq!(store.set_skip_limit("u1", 9).await.unwrap(), 2);
        let limits: Vec<u64> = store
            .subscriptions_for("u1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.skip_alert_limit)
            .collect();
        assert_eq!(limits, vec![9, 9]);
        assert_eq!(store.subscriptions_for("u2").await.unwrap()[0].skip_alert_limit, 1);
    }

    #[tokio::test]
    async fn test_commit_skips_removed_subscriptions() {
        let store = MemoryStore::new(1);
        store.subscribe("u1", "V1").await.unwrap();

        let state = NotifiedState {
            status: Some(ValidatorStatus::Active),
            commission: Some(5),
            notified_skip_count: 0,
            notified_epoch: 3,
        };
        let commit = BaselineCommit {
            network_epoch: Some(3),
            whale_stakes: vec![("V1".to_string(), 500)],
            subscriptions: vec![
                SubscriptionUpdate {
                    user_id: "u1".to_string(),
                    identity: "V1".to_string(),
                    state: state.clone(),
                },
                SubscriptionUpdate {
                    user_id: "gone".to_string(),
                    identity: "V1".to_string(),
                    state: state.clone(),
                },
            ],
        };
        store.commit(&commit).await.unwrap();

        assert_eq!(store.network_epoch().await.unwrap(), 3);
        assert_eq!(store.whale_baselines().await.unwrap().get("V1"), Some(&500));
        let subs = store.subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].last_notified, state);
    }
}
