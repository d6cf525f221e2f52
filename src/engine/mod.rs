//! Reconciliation loop.
//!
//! One cycle: force-read the snapshot, load baselines, detect deltas,
//! dispatch the alerts, then commit the new baselines. Dispatch happens
//! before commit, so a crash between the two re-sends the same alerts
//! (with the same idempotency keys) rather than losing them.
//!
//! Cycles run inline on a single task and never overlap; a cycle that
//! overruns the interval makes the scheduler skip the missed ticks.

use crate::detector::{Baselines, DeltaDetector};
use crate::metrics::{CycleMetrics, CycleOutcome, CycleRecord};
use crate::notify::{DispatchReport, Dispatcher};
use crate::snapshot::{Freshness, SnapshotCache};
use crate::store::{BaselineStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    cache: Arc<SnapshotCache>,
    store: Arc<dyn BaselineStore>,
    detector: DeltaDetector,
    dispatcher: Dispatcher,
    /// Deadline for reading baselines and for the commit.
    store_timeout: Duration,
    metrics: Arc<Mutex<CycleMetrics>>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<SnapshotCache>,
        store: Arc<dyn BaselineStore>,
        detector: DeltaDetector,
        dispatcher: Dispatcher,
        store_timeout: Duration,
        metrics: Arc<Mutex<CycleMetrics>>,
    ) -> Self {
        Self {
            cache,
            store,
            detector,
            dispatcher,
            store_timeout,
            metrics,
        }
    }

    /// Run cycles forever: first after `warmup`, then every `interval`.
    pub fn spawn(self: Arc<Self>, interval: Duration, warmup: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                warmup_secs = warmup.as_secs(),
                "reconciler scheduled"
            );
            tokio::time::sleep(warmup).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// Run one reconciliation cycle and record its outcome.
    pub async fn run_cycle(&self) -> CycleRecord {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut record = CycleRecord {
            started_at,
            duration_ms: 0,
            outcome: CycleOutcome::SkippedNoData,
            epoch: 0,
            validators: 0,
            events: 0,
            writes: 0,
            dispatch: DispatchReport::default(),
        };

        let outcome = self.cycle(&mut record).await;
        record.outcome = outcome;
        record.duration_ms = started.elapsed().as_millis() as u64;

        match record.outcome {
            CycleOutcome::Completed => info!(
                epoch = record.epoch,
                validators = record.validators,
                events = record.events,
                delivered = record.dispatch.delivered,
                writes = record.writes,
                duration_ms = record.duration_ms,
                "cycle complete"
            ),
            outcome => warn!(outcome = %outcome, duration_ms = record.duration_ms, "cycle did not complete"),
        }

        let mut metrics = self.metrics.lock().await;
        metrics.record(record.clone());
        metrics.log_summary();
        record
    }

    async fn cycle(&self, record: &mut CycleRecord) -> CycleOutcome {
        let (snapshot, freshness) = self.cache.read(true).await;
        if freshness != Freshness::Fresh || snapshot.is_empty() {
            warn!(freshness = ?freshness, "no fresh snapshot, skipping cycle");
            return CycleOutcome::SkippedNoData;
        }
        record.epoch = snapshot.current_epoch();
        record.validators = snapshot.len();

        let baselines = match tokio::time::timeout(self.store_timeout, self.load_baselines()).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => {
                error!(error = %e, "failed to load baselines, nothing emitted");
                return CycleOutcome::StoreUnavailable;
            }
            Err(_) => {
                error!(
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "baseline load timed out, nothing emitted"
                );
                return CycleOutcome::TimedOut;
            }
        };
        debug!(
            cursor = baselines.network_epoch,
            whales = baselines.whales.len(),
            subscriptions = baselines.subscriptions.len(),
            "baselines loaded"
        );

        let detection = self.detector.detect(&snapshot, &baselines);
        record.events = detection.events.len();
        record.writes = detection.commit.len();

        if !detection.events.is_empty() {
            record.dispatch = self.dispatcher.dispatch(&detection.events).await;
        }

        if detection.commit.is_empty() {
            return CycleOutcome::Completed;
        }
        match tokio::time::timeout(self.store_timeout, self.store.commit(&detection.commit)).await {
            Ok(Ok(())) => CycleOutcome::Completed,
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    writes = record.writes,
                    "baseline commit failed, alerts may repeat next cycle"
                );
                CycleOutcome::CommitFailed
            }
            Err(_) => {
                error!(writes = record.writes, "baseline commit timed out");
                CycleOutcome::CommitFailed
            }
        }
    }

    async fn load_baselines(&self) -> Result<Baselines, StoreError> {
        Ok(Baselines {
            network_epoch: self.store.network_epoch().await?,
            whales: self.store.whale_baselines().await?,
            subscriptions: self.store.subscriptions().await?,
        })
    }
}
