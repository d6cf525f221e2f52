//! Validator snapshot model.
//!
//! A `Snapshot` is one fully decoded view of every validator plus the
//! network aggregates. It is built in one go from the source's JSON and is
//! never patched afterwards: a refresh produces a brand new `Snapshot`.
//!
//! Source JSON (field names as produced by the network data exporter):
//!
//! ```text
//! {
//!   "active_stake": 123456789,
//!   "validators": [
//!     { "identity": "...", "name": "...", "status": "Active",
//!       "activatedStake": 0, "voteBalanceLamports": 0, "commission": 5,
//!       "skipped_slots_1_epochs": 0, "assigned_slots_1_epochs": 0,
//!       "rewards_last_1_epochs_xnt": 1.25,
//!       "epochCreditsFull": [[41, 1000, 900], [42, 1100, 1000]] }
//!   ]
//! }
//! ```

pub mod cache;
pub mod source;

pub use cache::{Freshness, SnapshotCache};
pub use source::{FileSource, HttpSource, SnapshotSource};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot not found: {0}")]
    NotFound(String),
    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("snapshot is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("snapshot field `{0}` is not a non-negative number")]
    InvalidField(&'static str),
    #[error("snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("snapshot endpoint returned status {0}")]
    Status(u16),
    #[error("snapshot load timed out after {0}ms")]
    Timeout(u64),
}

/// Validator health as reported by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum ValidatorStatus {
    Active,
    Delinquent,
}

impl From<String> for ValidatorStatus {
    fn from(s: String) -> Self {
        if s == "Active" {
            ValidatorStatus::Active
        } else {
            ValidatorStatus::Delinquent
        }
    }
}

impl std::fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidatorStatus::Active => write!(f, "Active"),
            ValidatorStatus::Delinquent => write!(f, "Delinquent"),
        }
    }
}

/// One validator as seen in a single snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: ValidatorStatus,
    /// Activated stake in base units.
    #[serde(rename = "activatedStake", default)]
    pub activated_stake: u64,
    #[serde(rename = "voteBalanceLamports", default)]
    pub vote_balance: u64,
    #[serde(default)]
    pub commission: u8,
    #[serde(rename = "skipped_slots_1_epochs", default)]
    pub skipped_slots_epoch: u64,
    #[serde(rename = "assigned_slots_1_epochs", default)]
    pub assigned_slots_epoch: u64,
    #[serde(rename = "rewards_last_1_epochs_xnt", default)]
    pub rewards_last_epoch: Decimal,
    /// (epoch, credits) pairs, oldest first.
    #[serde(
        rename = "epochCreditsFull",
        default,
        deserialize_with = "deserialize_epoch_credits"
    )]
    pub epoch_credits: Vec<(u64, u64)>,
}

impl ValidatorRecord {
    /// Epoch of the most recent credits entry.
    pub fn latest_epoch(&self) -> Option<u64> {
        self.epoch_credits.last().map(|(epoch, _)| *epoch)
    }

    /// Display name, falling back to a shortened identity.
    pub fn label(&self) -> String {
        match self.name.as_deref() {
            Some(n) if !n.trim().is_empty() => n.to_string(),
            _ => self.identity.chars().take(8).collect(),
        }
    }
}

/// The exporter writes credits as `[epoch, credits, previous_credits]`.
/// Only the first two columns matter here; short rows are dropped.
fn deserialize_epoch_credits<'de, D>(deserializer: D) -> Result<Vec<(u64, u64)>, D::Error>
where
    D: Deserializer<'de>,
{
    let rows: Option<Vec<Vec<u64>>> = Option::deserialize(deserializer)?;
    Ok(rows
        .unwrap_or_default()
        .into_iter()
        .filter_map(|row| match row.as_slice() {
            [epoch, credits, ..] => Some((*epoch, *credits)),
            _ => None,
        })
        .collect())
}

/// Wire shape before validation. Top-level fields are optional here so a
/// missing one is reported by name instead of as a generic parse error.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    validators: Option<Vec<ValidatorRecord>>,
    active_stake: Option<serde_json::Number>,
}

/// An immutable, fully loaded view of the network.
#[derive(Debug, Clone)]
pub struct Snapshot {
    validators: Vec<ValidatorRecord>,
    by_identity: HashMap<String, usize>,
    active_stake: u64,
    current_epoch: u64,
    loaded_at: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(Vec::new(), 0)
    }
}

impl Snapshot {
    pub fn new(validators: Vec<ValidatorRecord>, active_stake: u64) -> Self {
        let mut by_identity = HashMap::with_capacity(validators.len());
        for (idx, v) in validators.iter().enumerate() {
            by_identity.entry(v.identity.clone()).or_insert(idx);
        }
        let current_epoch = validators
            .iter()
            .filter_map(ValidatorRecord::latest_epoch)
            .max()
            .unwrap_or(0);

        Self {
            validators,
            by_identity,
            active_stake,
            current_epoch,
            loaded_at: Utc::now(),
        }
    }

    /// Decode and validate a snapshot document. Either the whole document
    /// is accepted or an error is returned.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let raw: RawSnapshot = serde_json::from_slice(bytes)?;
        let validators = raw
            .validators
            .ok_or(SnapshotError::MissingField("validators"))?;
        let stake = raw
            .active_stake
            .ok_or(SnapshotError::MissingField("active_stake"))?;
        let active_stake = stake
            .as_u64()
            .or_else(|| stake.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or(SnapshotError::InvalidField("active_stake"))?;

        Ok(Self::new(validators, active_stake))
    }

    pub fn validators(&self) -> &[ValidatorRecord] {
        &self.validators
    }

    pub fn get(&self, identity: &str) -> Option<&ValidatorRecord> {
        self.by_identity
            .get(identity)
            .and_then(|idx| self.validators.get(*idx))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Network-wide active stake in base units.
    pub fn active_stake(&self) -> u64 {
        self.active_stake
    }

    /// Highest epoch seen across every validator's credit history.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Validators sorted by activated stake, largest first.
    pub fn top_by_stake(&self, n: usize) -> Vec<&ValidatorRecord> {
        let mut sorted: Vec<&ValidatorRecord> = self.validators.iter().collect();
        sorted.sort_by(|a, b| b.activated_stake.cmp(&a.activated_stake));
        sorted.truncate(n);
        sorted
    }

    /// 1-based stake rank of `identity`.
    pub fn rank_of(&self, identity: &str) -> Option<usize> {
        let target = self.get(identity)?;
        let ahead = self
            .validators
            .iter()
            .filter(|v| v.activated_stake > target.activated_stake)
            .count();
        Some(ahead + 1)
    }
}
