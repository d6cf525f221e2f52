//! Reconciliation cycle metrics.
//!
//! Tracks the outcome of recent cycles and how many in a row have failed on
//! the store. The dashboard's health endpoint reads this; so does the
//! periodic summary log line.

use crate::notify::DispatchReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Maximum history entries kept.
const MAX_HISTORY: usize = 500;

/// Consecutive store failures before health reports degraded.
pub const DEGRADED_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Detection, dispatch and commit all went through.
    Completed,
    /// No fresh snapshot; nothing was evaluated.
    SkippedNoData,
    /// Baselines could not be read; nothing was emitted.
    StoreUnavailable,
    /// Alerts went out but the baseline commit failed.
    CommitFailed,
    /// The cycle ran past its deadline before dispatch; nothing was emitted.
    TimedOut,
}

impl CycleOutcome {
    fn is_store_failure(self) -> bool {
        matches!(
            self,
            CycleOutcome::StoreUnavailable | CycleOutcome::CommitFailed | CycleOutcome::TimedOut
        )
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Completed => write!(f, "completed"),
            CycleOutcome::SkippedNoData => write!(f, "skipped_no_data"),
            CycleOutcome::StoreUnavailable => write!(f, "store_unavailable"),
            CycleOutcome::CommitFailed => write!(f, "commit_failed"),
            CycleOutcome::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One finished reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: CycleOutcome,
    pub epoch: u64,
    pub validators: usize,
    pub events: usize,
    pub writes: usize,
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No cycle has finished yet.
    Starting,
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    pub consecutive_store_failures: u32,
    pub total_cycles: u64,
    pub total_events: u64,
}

#[derive(Debug, Default)]
pub struct CycleMetrics {
    history: VecDeque<CycleRecord>,
    consecutive_store_failures: u32,
    total_cycles: u64,
    total_events: u64,
}

impl CycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: CycleRecord) {
        self.total_cycles += 1;
        self.total_events += record.events as u64;

        if record.outcome.is_store_failure() {
            self.consecutive_store_failures += 1;
            if self.consecutive_store_failures == DEGRADED_AFTER {
                warn!(
                    failures = self.consecutive_store_failures,
                    "baseline store failing repeatedly, reporting degraded"
                );
            }
        } else if record.outcome == CycleOutcome::Completed {
            self.consecutive_store_failures = 0;
        }

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Most recent cycles, newest first.
    pub fn recent(&self, count: usize) -> Vec<CycleRecord> {
        self.history.iter().rev().take(count).cloned().collect()
    }

    pub fn health(&self) -> HealthReport {
        let last = self.history.back();
        let status = if last.is_none() {
            HealthState::Starting
        } else if self.consecutive_store_failures >= DEGRADED_AFTER {
            HealthState::Degraded
        } else {
            HealthState::Ok
        };
        HealthReport {
            status,
            last_cycle_at: last.map(|r| r.started_at),
            last_outcome: last.map(|r| r.outcome),
            consecutive_store_failures: self.consecutive_store_failures,
            total_cycles: self.total_cycles,
            total_events: self.total_events,
        }
    }

    /// Log a summary line (called after each cycle).
    pub fn log_summary(&self) {
        let health = self.health();
        info!(
            cycles = health.total_cycles,
            events = health.total_events,
            store_failures = health.consecutive_store_failures,
            status = ?health.status,
            "cycle metrics"
        );
    }
}
