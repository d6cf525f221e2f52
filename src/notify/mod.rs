//! Alert delivery.
//!
//! A `Notifier` delivers one event to one target and reports what happened
//! as a `DeliveryResult`; it never errors out. The `Dispatcher` walks a
//! cycle's events through the notifier, one at a time, and keeps going
//! whatever a single recipient does. Nothing is retried: an alert that
//! could not be delivered still counts as sent for dedup purposes.

pub mod telegram;

pub use telegram::TelegramNotifier;

use crate::detector::{AlertEvent, AlertKind, AlertTarget};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// The recipient cannot be reached (blocked the bot, chat gone).
    RecipientUnreachable(String),
    /// Network trouble, rate limiting, server errors.
    TransientFailure(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, target: &AlertTarget, event: &AlertEvent) -> DeliveryResult;
}

/// Per-cycle delivery tally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub unreachable: usize,
    pub failed: usize,
    /// Events dropped because an earlier event in the batch had the same key.
    pub duplicates: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.unreachable + self.failed
    }
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, send_timeout: Duration) -> Self {
        Self {
            notifier,
            send_timeout,
        }
    }

    pub async fn dispatch(&self, events: &[AlertEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for event in events {
            if !seen.insert(event.key.as_str()) {
                debug!(key = %event.key, "duplicate alert key in batch, skipping");
                report.duplicates += 1;
                continue;
            }

            let result = match tokio::time::timeout(
                self.send_timeout,
                self.notifier.send(&event.target, event),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => DeliveryResult::TransientFailure(format!(
                    "send timed out after {}ms",
                    self.send_timeout.as_millis()
                )),
            };

            match result {
                DeliveryResult::Delivered => {
                    debug!(kind = %event.kind, key = %event.key, "alert delivered");
                    report.delivered += 1;
                }
                DeliveryResult::RecipientUnreachable(reason) => {
                    info!(
                        kind = %event.kind,
                        target = ?event.target,
                        reason = %reason,
                        "recipient unreachable, alert acknowledged anyway"
                    );
                    report.unreachable += 1;
                }
                DeliveryResult::TransientFailure(reason) => {
                    warn!(
                        kind = %event.kind,
                        target = ?event.target,
                        reason = %reason,
                        "alert delivery failed, not retrying"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Writes alerts to the log instead of sending them anywhere.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &AlertTarget, event: &AlertEvent) -> DeliveryResult {
        match &event.kind {
            AlertKind::NewEpoch {
                epoch,
                active_stake,
            } => info!(target = ?target, epoch, active_stake, "ALERT new epoch"),
            AlertKind::Whale {
                identity,
                delta,
                direction,
                ..
            } => info!(
                target = ?target,
                identity = %identity,
                delta = %delta,
                direction = %direction,
                "ALERT whale movement"
            ),
            AlertKind::Status {
                identity,
                previous,
                current,
                ..
            } => info!(
                target = ?target,
                identity = %identity,
                previous = %previous,
                current = %current,
                "ALERT status change"
            ),
            AlertKind::Commission {
                identity,
                previous,
                current,
                ..
            } => info!(
                target = ?target,
                identity = %identity,
                previous,
                current,
                "ALERT commission change"
            ),
            AlertKind::Skips {
                identity,
                skipped,
                limit,
                epoch,
                ..
            } => info!(
                target = ?target,
                identity = %identity,
                skipped,
                limit,
                epoch,
                "ALERT skipped slots"
            ),
        }
        DeliveryResult::Delivered
    }
}
