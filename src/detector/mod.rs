//! Delta detector: the alerting state machine.
//!
//! Given a fresh snapshot and the stored baselines, produce the alert
//! events to send plus the baseline writes that acknowledge them. The
//! detector itself is pure; the engine loads baselines, dispatches the
//! events and commits the writes.
//!
//! Categories:
//! - **Epoch transition** (public): one report per epoch increase. A zero
//!   cursor seeds silently.
//! - **Whale movement** (public): stake moved by at least the threshold
//!   since the baseline. Unseen identities are seeded without alerting.
//! - **Status / commission** (private): changed since the subscriber was
//!   last told.
//! - **Skipped slots** (private): at or above the subscriber's limit and
//!   higher than the count already reported this epoch.

use crate::snapshot::{Snapshot, ValidatorStatus};
use crate::store::{BaselineCommit, NotifiedState, Subscription, SubscriptionUpdate};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// When the whale baseline moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhalePolicy {
    /// Only when an alert fires. Oscillation around one baseline stays quiet.
    #[default]
    Hysteresis,
    /// Every cycle, so alerts compare against the previous poll.
    EveryCycle,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Whale threshold in whole units.
    pub whale_threshold: u64,
    /// Base units per whole unit.
    pub unit_scale: u64,
    pub whale_policy: WhalePolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            whale_threshold: 50_000,
            unit_scale: 1_000_000_000,
            whale_policy: WhalePolicy::Hysteresis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertTarget {
    /// The public broadcast channel.
    Public,
    /// A single subscriber.
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inflow,
    Outflow,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inflow => write!(f, "inflow"),
            Direction::Outflow => write!(f, "outflow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    NewEpoch {
        epoch: u64,
        active_stake: u64,
    },
    Whale {
        identity: String,
        name: Option<String>,
        /// Signed change in base units.
        delta: i128,
        direction: Direction,
    },
    Status {
        identity: String,
        name: Option<String>,
        previous: ValidatorStatus,
        current: ValidatorStatus,
    },
    Commission {
        identity: String,
        name: Option<String>,
        previous: u8,
        current: u8,
    },
    Skips {
        identity: String,
        name: Option<String>,
        skipped: u64,
        limit: u64,
        epoch: u64,
    },
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::NewEpoch { .. } => write!(f, "NEW_EPOCH"),
            AlertKind::Whale { .. } => write!(f, "WHALE"),
            AlertKind::Status { .. } => write!(f, "STATUS"),
            AlertKind::Commission { .. } => write!(f, "COMMISSION"),
            AlertKind::Skips { .. } => write!(f, "SKIPS"),
        }
    }
}

/// One alert, addressed and keyed.
///
/// `key` is stable for a given change: the same change detected twice
/// (e.g. after a lost commit) yields the same key, so a sink can drop the
/// repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub target: AlertTarget,
    pub kind: AlertKind,
    pub key: String,
}

/// Baselines as read from the store at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub struct Baselines {
    pub network_epoch: u64,
    pub whales: HashMap<String, u64>,
    pub subscriptions: Vec<Subscription>,
}

/// Output of one detector run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub events: Vec<AlertEvent>,
    pub commit: BaselineCommit,
}

pub struct DeltaDetector {
    config: DetectorConfig,
}

impl DeltaDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &Snapshot, baselines: &Baselines) -> Detection {
        let mut detection = Detection::default();
        self.check_epoch(snapshot, baselines.network_epoch, &mut detection);
        self.check_whales(snapshot, &baselines.whales, &mut detection);
        for sub in &baselines.subscriptions {
            self.check_subscription(snapshot, sub, &mut detection);
        }
        debug!(
            events = detection.events.len(),
            writes = detection.commit.len(),
            epoch = snapshot.current_epoch(),
            "delta detection complete"
        );
        detection
    }

    fn check_epoch(&self, snapshot: &Snapshot, cursor: u64, out: &mut Detection) {
        let curr = snapshot.current_epoch();
        if cursor == 0 {
            if curr > 0 {
                out.commit.network_epoch = Some(curr);
            }
            return;
        }
        if curr > cursor {
            out.events.push(AlertEvent {
                target: AlertTarget::Public,
                kind: AlertKind::NewEpoch {
                    epoch: curr,
                    active_stake: snapshot.active_stake(),
                },
                key: format!("epoch:{}", curr),
            });
            out.commit.network_epoch = Some(curr);
        }
    }

    fn check_whales(&self, snapshot: &Snapshot, whales: &HashMap<String, u64>, out: &mut Detection) {
        let threshold = self.config.whale_threshold as u128 * self.config.unit_scale as u128;

        for v in snapshot.validators() {
            let stake = v.activated_stake;
            let Some(&baseline) = whales.get(&v.identity) else {
                out.commit.whale_stakes.push((v.identity.clone(), stake));
                continue;
            };

            let delta = stake as i128 - baseline as i128;
            let fired = delta.unsigned_abs() >= threshold;
            if fired {
                out.events.push(AlertEvent {
                    target: AlertTarget::Public,
                    kind: AlertKind::Whale {
                        identity: v.identity.clone(),
                        name: v.name.clone(),
                        delta,
                        direction: if delta > 0 {
                            Direction::Inflow
                        } else {
                            Direction::Outflow
                        },
                    },
                    key: format!("whale:{}:{}->{}", v.identity, baseline, stake),
                });
            }

            let advance = match self.config.whale_policy {
                WhalePolicy::Hysteresis => fired,
                WhalePolicy::EveryCycle => stake != baseline,
            };
            if advance {
                out.commit.whale_stakes.push((v.identity.clone(), stake));
            }
        }
    }

    fn check_subscription(&self, snapshot: &Snapshot, sub: &Subscription, out: &mut Detection) {
        let Some(curr) = snapshot.get(&sub.identity) else {
            return;
        };
        let prev = &sub.last_notified;
        let epoch = snapshot.current_epoch();
        let target = AlertTarget::User(sub.user_id.clone());

        if let Some(previous) = prev.status {
            if previous != curr.status {
                out.events.push(private_event(
                    &target,
                    AlertKind::Status {
                        identity: curr.identity.clone(),
                        name: curr.name.clone(),
                        previous,
                        current: curr.status,
                    },
                    format!("status:{}:{}:{}:{}", sub.user_id, curr.identity, epoch, curr.status),
                ));
            }
        }

        if let Some(previous) = prev.commission {
            if previous != curr.commission {
                out.events.push(private_event(
                    &target,
                    AlertKind::Commission {
                        identity: curr.identity.clone(),
                        name: curr.name.clone(),
                        previous,
                        current: curr.commission,
                    },
                    format!(
                        "commission:{}:{}:{}:{}->{}",
                        sub.user_id, curr.identity, epoch, previous, curr.commission
                    ),
                ));
            }
        }

        let mut notified_skip_count = prev.notified_skip_count;
        if epoch > prev.notified_epoch {
            notified_skip_count = 0;
        }
        let skipped = curr.skipped_slots_epoch;
        if skipped >= sub.skip_alert_limit && skipped > notified_skip_count {
            out.events.push(private_event(
                &target,
                AlertKind::Skips {
                    identity: curr.identity.clone(),
                    name: curr.name.clone(),
                    skipped,
                    limit: sub.skip_alert_limit,
                    epoch,
                },
                format!("skips:{}:{}:{}:{}", sub.user_id, curr.identity, epoch, skipped),
            ));
            notified_skip_count = skipped;
        }

        let next = NotifiedState {
            status: Some(curr.status),
            commission: Some(curr.commission),
            notified_skip_count,
            notified_epoch: epoch,
        };
        if &next != prev {
            out.commit.subscriptions.push(SubscriptionUpdate {
                user_id: sub.user_id.clone(),
                identity: sub.identity.clone(),
                state: next,
            });
        }
    }
}

fn private_event(target: &AlertTarget, kind: AlertKind, key: String) -> AlertEvent {
    AlertEvent {
        target: target.clone(),
        kind,
        key,
    }
}

/// Fold a detection's writes into the baselines, as a successful commit
/// would. Lets callers (and tests) chain cycles without a store.
pub fn apply_commit(baselines: &mut Baselines, commit: &BaselineCommit) {
    if let Some(epoch) = commit.network_epoch {
        baselines.network_epoch = epoch;
    }
    for (identity, stake) in &commit.whale_stakes {
        baselines.whales.insert(identity.clone(), *stake);
    }
    for update in &commit.subscriptions {
        if let Some(sub) = baselines
            .subscriptions
            .iter_mut()
            .find(|s| s.user_id == update.user_id && s.identity == update.identity)
        {
            sub.last_notified = update.state.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::record;
    use crate::snapshot::ValidatorRecord;

    const UNIT: u64 = 1_000_000_000;

    fn validator(identity: &str, stake_units: u64, epoch: u64) -> ValidatorRecord {
        let mut v = record(identity, Some(identity));
        v.activated_stake = stake_units * UNIT;
        v.epoch_credits = vec![(epoch, 100)];
        v
    }

    fn snapshot(validators: Vec<ValidatorRecord>) -> Snapshot {
        let total = validators.iter().map(|v| v.activated_stake).sum();
        Snapshot::new(validators, total)
    }

    fn subscription(user: &str, identity: &str, limit: u64, state: NotifiedState) -> Subscription {
        Subscription {
            user_id: user.to_string(),
            identity: identity.to_string(),
            skip_alert_limit: limit,
            last_notified: state,
        }
    }

    fn detector() -> DeltaDetector {
        DeltaDetector::new(DetectorConfig::default())
    }

    #[test]
    fn test_epoch_seeds_silently_on_first_run() {
        let snap = snapshot(vec![validator("A", 10, 42)]);
        let det = detector().detect(&snap, &Baselines::default());

        assert!(det.events.iter().all(|e| !matches!(e.kind, AlertKind::NewEpoch { .. })));
        assert_eq!(det.commit.network_epoch, Some(42));
    }

    #[test]
    fn test_epoch_transition_reports_once() {
        let snap = snapshot(vec![validator("A", 10, 43), validator("B", 5, 42)]);
        let mut baselines = Baselines {
            network_epoch: 42,
            ..Baselines::default()
        };

        let det = detector().detect(&snap, &baselines);
        let epochs: Vec<&AlertEvent> = det
            .events
            .iter()
            .filter(|e| matches!(e.kind, AlertKind::NewEpoch { .. }))
            .collect();
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].target, AlertTarget::Public);
        assert_eq!(
            epochs[0].kind,
            AlertKind::NewEpoch {
                epoch: 43,
                active_stake: 15 * UNIT
            }
        );
        assert_eq!(det.commit.network_epoch, Some(43));

        apply_commit(&mut baselines, &det.commit);
        let again = detector().detect(&snap, &baselines);
        assert!(again.events.is_empty());
        assert_eq!(again.commit.network_epoch, None);
    }

    #[test]
    fn test_whale_seed_does_not_alert() {
        let snap = snapshot(vec![validator("A", 1_000_000, 1)]);
        let det = detector().detect(&snap, &Baselines::default());
        assert!(det.events.iter().all(|e| !matches!(e.kind, AlertKind::Whale { .. })));
        assert_eq!(det.commit.whale_stakes, vec![("A".to_string(), 1_000_000 * UNIT)]);
    }

    #[test]
    fn test_whale_hysteresis_fires_once_per_crossing() {
        let mut baselines = Baselines {
            network_epoch: 1,
            ..Baselines::default()
        };
        baselines.whales.insert("A".to_string(), 1_000_000 * UNIT);

        let mut fired = Vec::new();
        for stake in [1_010_000, 1_045_000, 1_060_000, 1_060_000, 1_090_000] {
            let snap = snapshot(vec![validator("A", stake, 1)]);
            let det = detector().detect(&snap, &baselines);
            for e in &det.events {
                if let AlertKind::Whale { delta, direction, .. } = &e.kind {
                    fired.push((stake, *delta, *direction));
                }
            }
            apply_commit(&mut baselines, &det.commit);
        }

        assert_eq!(
            fired,
            vec![(1_060_000, 60_000 * UNIT as i128, Direction::Inflow)]
        );
        assert_eq!(baselines.whales["A"], 1_060_000 * UNIT);
    }

    #[test]
    fn test_whale_outflow() {
        let mut baselines = Baselines::default();
        baselines.whales.insert("A".to_string(), 200_000 * UNIT);
        let snap = snapshot(vec![validator("A", 150_000, 1)]);

        let det = detector().detect(&snap, &baselines);
        let whale = det
            .events
            .iter()
            .find_map(|e| match &e.kind {
                AlertKind::Whale { delta, direction, .. } => Some((*delta, *direction)),
                _ => None,
            })
            .unwrap();
        assert_eq!(whale, (-(50_000 * UNIT as i128), Direction::Outflow));
    }

    #[test]
    fn test_whale_every_cycle_policy_tracks_previous_poll() {
        let det = DeltaDetector::new(DetectorConfig {
            whale_policy: WhalePolicy::EveryCycle,
            ..DetectorConfig::default()
        });
        let mut baselines = Baselines::default();
        baselines.whales.insert("A".to_string(), 1_000_000 * UNIT);

        let mut count = 0;
        for stake in [1_030_000, 1_060_000, 1_090_000] {
            let snap = snapshot(vec![validator("A", stake, 1)]);
            let out = det.detect(&snap, &baselines);
            count += out
                .events
                .iter()
                .filter(|e| matches!(e.kind, AlertKind::Whale { .. }))
                .count();
            apply_commit(&mut baselines, &out.commit);
        }
        // Every step is 30k, below the threshold against the previous poll.
        assert_eq!(count, 0);
        assert_eq!(baselines.whales["A"], 1_090_000 * UNIT);
    }

    #[test]
    fn test_first_subscription_cycle_seeds_without_alerts() {
        let mut v = validator("A", 10, 5);
        v.skipped_slots_epoch = 0;
        let snap = snapshot(vec![v]);
        let baselines = Baselines {
            network_epoch: 5,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription("u1", "A", 1, NotifiedState::default())],
        };

        let det = detector().detect(&snap, &baselines);
        assert!(det.events.is_empty());
        assert_eq!(
            det.commit.subscriptions,
            vec![SubscriptionUpdate {
                user_id: "u1".to_string(),
                identity: "A".to_string(),
                state: NotifiedState {
                    status: Some(ValidatorStatus::Active),
                    commission: Some(5),
                    notified_skip_count: 0,
                    notified_epoch: 5,
                },
            }]
        );
    }

    #[test]
    fn test_status_and_commission_changes() {
        let mut v = validator("A", 10, 5);
        v.status = ValidatorStatus::Delinquent;
        v.commission = 10;
        let snap = snapshot(vec![v]);
        let baselines = Baselines {
            network_epoch: 5,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription(
                "u1",
                "A",
                1,
                NotifiedState {
                    status: Some(ValidatorStatus::Active),
                    commission: Some(5),
                    notified_skip_count: 0,
                    notified_epoch: 5,
                },
            )],
        };

        let det = detector().detect(&snap, &baselines);
        assert_eq!(det.events.len(), 2);
        assert!(det
            .events
            .iter()
            .all(|e| e.target == AlertTarget::User("u1".to_string())));
        assert!(matches!(
            det.events[0].kind,
            AlertKind::Status {
                previous: ValidatorStatus::Active,
                current: ValidatorStatus::Delinquent,
                ..
            }
        ));
        assert!(matches!(
            det.events[1].kind,
            AlertKind::Commission {
                previous: 5,
                current: 10,
                ..
            }
        ));
        let state = &det.commit.subscriptions[0].state;
        assert_eq!(state.status, Some(ValidatorStatus::Delinquent));
        assert_eq!(state.commission, Some(10));
    }

    #[test]
    fn test_skip_alert_epoch_reset() {
        let notified = NotifiedState {
            status: Some(ValidatorStatus::Active),
            commission: Some(5),
            notified_skip_count: 5,
            notified_epoch: 10,
        };
        let baselines = |epoch: u64| Baselines {
            network_epoch: epoch,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription("u1", "A", 3, notified.clone())],
        };

        let mut same_epoch = validator("A", 10, 10);
        same_epoch.skipped_slots_epoch = 5;
        let det = detector().detect(&snapshot(vec![same_epoch]), &baselines(10));
        assert!(det.events.is_empty());
        assert!(det.commit.subscriptions.is_empty());

        let mut next_epoch = validator("A", 10, 11);
        next_epoch.skipped_slots_epoch = 5;
        let snap = snapshot(vec![next_epoch]);
        let mut b = baselines(11);
        let det = detector().detect(&snap, &b);
        assert_eq!(det.events.len(), 1);
        assert!(matches!(
            det.events[0].kind,
            AlertKind::Skips {
                skipped: 5,
                limit: 3,
                epoch: 11,
                ..
            }
        ));
        let state = &det.commit.subscriptions[0].state;
        assert_eq!(state.notified_skip_count, 5);
        assert_eq!(state.notified_epoch, 11);

        apply_commit(&mut b, &det.commit);
        assert!(detector().detect(&snap, &b).events.is_empty());
    }

    #[test]
    fn test_skips_below_limit_or_not_rising_stay_quiet() {
        let notified = NotifiedState {
            status: Some(ValidatorStatus::Active),
            commission: Some(5),
            notified_skip_count: 4,
            notified_epoch: 7,
        };
        let mut v = validator("A", 10, 7);
        v.skipped_slots_epoch = 4;
        let baselines = Baselines {
            network_epoch: 7,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![
                subscription("u1", "A", 2, notified.clone()),
                subscription("u2", "A", 9, NotifiedState { notified_skip_count: 0, ..notified }),
            ],
        };
        let det = detector().detect(&snapshot(vec![v]), &baselines);
        assert!(det.events.is_empty());
    }

    #[test]
    fn test_rising_skips_alert_again_within_epoch() {
        let notified = NotifiedState {
            status: Some(ValidatorStatus::Active),
            commission: Some(5),
            notified_skip_count: 4,
            notified_epoch: 7,
        };
        let mut v = validator("A", 10, 7);
        v.skipped_slots_epoch = 6;
        let baselines = Baselines {
            network_epoch: 7,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription("u1", "A", 2, notified)],
        };
        let det = detector().detect(&snapshot(vec![v]), &baselines);
        assert_eq!(det.events.len(), 1);
        assert_eq!(det.commit.subscriptions[0].state.notified_skip_count, 6);
    }

    #[test]
    fn test_absent_identity_left_untouched() {
        let snap = snapshot(vec![validator("A", 10, 3)]);
        let baselines = Baselines {
            network_epoch: 3,
            whales: [("A".to_string(), 10 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription(
                "u1",
                "GONE",
                1,
                NotifiedState {
                    status: Some(ValidatorStatus::Active),
                    ..NotifiedState::default()
                },
            )],
        };
        let det = detector().detect(&snap, &baselines);
        assert!(det.events.is_empty());
        assert!(det.commit.subscriptions.is_empty());
    }

    #[test]
    fn test_idempotent_and_deterministic() {
        let mut a = validator("A", 1_000_000, 9);
        a.skipped_slots_epoch = 3;
        a.status = ValidatorStatus::Delinquent;
        let snap = snapshot(vec![a, validator("B", 500, 9)]);
        let mut baselines = Baselines {
            network_epoch: 8,
            whales: [("A".to_string(), 900_000 * UNIT)].into_iter().collect(),
            subscriptions: vec![subscription(
                "u1",
                "A",
                1,
                NotifiedState {
                    status: Some(ValidatorStatus::Active),
                    commission: Some(5),
                    notified_skip_count: 0,
                    notified_epoch: 8,
                },
            )],
        };

        let first = detector().detect(&snap, &baselines);
        let repeat = detector().detect(&snap, &baselines);
        assert_eq!(first, repeat);
        // epoch + whale + status + skips
        assert_eq!(first.events.len(), 4);

        apply_commit(&mut baselines, &first.commit);
        let second = detector().detect(&snap, &baselines);
        assert!(second.events.is_empty());
        assert!(second.commit.is_empty());
    }
}
