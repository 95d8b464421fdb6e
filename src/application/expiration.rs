use super::audit::Auditor;
use super::bounded;
use crate::config::DEFAULT_STORE_TIMEOUT_MS;
use crate::domain::actor::Actor;
use crate::domain::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::domain::clock::ClockRef;
use crate::domain::pending_payment::{PaymentState, Transition};
use crate::domain::ports::{AuditTrailRef, PendingPaymentStoreRef, StateChange, TransitionOutcome};
use crate::error::Result;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Decides when the next sweep runs.
#[async_trait]
pub trait SweepTrigger: Send {
    /// Resolves when a sweep is due. `false` means the trigger is exhausted.
    async fn next(&mut self) -> bool;
}

/// Fires every `period`, first one `period` from now.
pub struct IntervalTrigger {
    interval: Interval,
}

impl IntervalTrigger {
    pub fn every(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn daily() -> Self {
        Self::every(Duration::from_secs(24 * 3600))
    }
}

#[async_trait]
impl SweepTrigger for IntervalTrigger {
    async fn next(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Fires whenever a unit is sent on its channel; exhausted when every sender
/// is dropped.
pub struct ManualTrigger {
    rx: mpsc::Receiver<()>,
}

impl ManualTrigger {
    pub fn channel(capacity: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SweepTrigger for ManualTrigger {
    async fn next(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Overdue rows seen by the scan.
    pub scanned: usize,
    pub expired: usize,
    /// Rows a concurrent reconciliation moved first.
    pub skipped: usize,
    pub failed: usize,
    pub audit_failures: usize,
    pub cancelled: bool,
}

/// Moves overdue `Pending` references to `Expired`.
///
/// The state check is part of the store's compare-and-swap, so a row that a
/// concurrent reconciliation settled or flagged is never overwritten.
pub struct ExpirationSweeper {
    store: PendingPaymentStoreRef,
    auditor: Auditor,
    clock: ClockRef,
    timeout: Duration,
}

impl ExpirationSweeper {
    pub fn new(store: PendingPaymentStoreRef, audit: AuditTrailRef, clock: ClockRef) -> Self {
        let timeout = Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS);
        Self {
            store,
            auditor: Auditor::new(audit, timeout),
            clock,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.auditor = self.auditor.with_timeout(timeout);
        self
    }

    /// Runs one sweep. Stops between rows once `shutdown` reads `true`; rows
    /// already expired stay expired.
    pub async fn sweep_once(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<SweepReport> {
        let now = self.clock.now();
        let overdue = bounded(self.timeout, "overdue scan", self.store.list_overdue(now)).await?;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..Default::default()
        };

        for row in overdue {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                tracing::info!(expired = report.expired, "Expiration sweep cancelled");
                report.cancelled = true;
                break;
            }

            let note = format!(
                "Expired automatically at {} (valid until {})",
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
                row.expiration_timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            let change = StateChange::new(Transition::Expire, note, now);
            let outcome =
                bounded(self.timeout, "expire transition", self.store.transition(row.id, change)).await;

            match outcome {
                Ok(TransitionOutcome::Applied(updated)) => {
                    report.expired += 1;
                    tracing::info!(reference = %updated.reference, "Reference expired");
                    let record = AuditRecord::new(
                        AuditAction::Expire,
                        &Actor::System,
                        now,
                        &updated.reference,
                        AuditOutcome::Success,
                    )
                    .with_states(Some(PaymentState::Pending), Some(PaymentState::Expired))
                    .with_details(json!({
                        "pendingPaymentId": updated.id,
                        "expirationTimestamp": updated.expiration_timestamp,
                    }));
                    if self.auditor.record(record).await.is_err() {
                        report.audit_failures += 1;
                    }
                }
                Ok(TransitionOutcome::Conflict(current)) => {
                    report.skipped += 1;
                    tracing::debug!(reference = %current.reference, state = %current.state, "Skipped, row moved on");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(reference = %row.reference, error = %e, "Failed to expire reference");
                }
            }
        }

        Ok(report)
    }

    /// Sweeps immediately to catch up on backlog, then once per trigger
    /// until the trigger is exhausted or `shutdown` flips to `true`.
    pub async fn run<T: SweepTrigger>(&self, mut trigger: T, mut shutdown: watch::Receiver<bool>) -> Vec<SweepReport> {
        let mut reports = Vec::new();
        loop {
            match self.sweep_once(Some(&shutdown)).await {
                Ok(report) => {
                    tracing::info!(
                        scanned = report.scanned,
                        expired = report.expired,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Expiration sweep finished"
                    );
                    reports.push(report);
                }
                Err(e) => tracing::warn!(error = %e, "Expiration sweep failed, will retry on next trigger"),
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                fired = trigger.next() => {
                    if !fired {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Expiration sweeper stopped");
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::{Clock, ManualClock};
    use crate::domain::money::Amount;
    use crate::domain::pending_payment::PendingPayment;
    use crate::domain::ports::{AuditTrail, PendingPaymentStore};
    use crate::infrastructure::in_memory::{InMemoryAuditTrail, InMemoryPendingPaymentStore};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn seed(store: &InMemoryPendingPaymentStore, clock: &ManualClock, reference: &str, hours: i64) -> PendingPayment {
        let now = clock.now();
        let row = PendingPayment::new(
            reference.to_string(),
            "student-1".to_string(),
            "tuition".to_string(),
            None,
            Amount::new(dec!(100)).unwrap(),
            now,
            now + ChronoDuration::hours(hours),
        );
        store.insert(row.clone()).await.unwrap();
        row
    }

    fn sweeper(store: &InMemoryPendingPaymentStore, audit: &InMemoryAuditTrail, clock: &ManualClock) -> ExpirationSweeper {
        ExpirationSweeper::new(
            Arc::new(store.clone()),
            Arc::new(audit.clone()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue() {
        let store = InMemoryPendingPaymentStore::new();
        let audit = InMemoryAuditTrail::new();
        let clock = ManualClock::default();
        let short = seed(&store, &clock, "SHORT", 1).await;
        let long = seed(&store, &clock, "LONG", 72).await;

        clock.advance(ChronoDuration::hours(2));
        let report = sweeper(&store, &audit, &clock).sweep_once(None).await.unwrap();
        assert_eq!(report.expired, 1);

        let short = store.get(short.id).await.unwrap().unwrap();
        assert_eq!(short.state, PaymentState::Expired);
        assert!(short.observations.contains("Expired automatically"));
        assert_eq!(store.get(long.id).await.unwrap().unwrap().state, PaymentState::Pending);
        assert_eq!(audit.records_for("SHORT").await.unwrap().len(), 1);

        // idempotent
        let again = sweeper(&store, &audit, &clock).sweep_once(None).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn test_sweep_stops_when_cancelled() {
        let store = InMemoryPendingPaymentStore::new();
        let audit = InMemoryAuditTrail::new();
        let clock = ManualClock::default();
        for i in 0..3 {
            seed(&store, &clock, &format!("R{i}"), 1).await;
        }
        clock.advance(ChronoDuration::hours(2));

        let (tx, rx) = watch::channel(true);
        let report = sweeper(&store, &audit, &clock).sweep_once(Some(&rx)).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.expired, 0);
        drop(tx);

        // a later run picks the rows up
        let report = sweeper(&store, &audit, &clock).sweep_once(None).await.unwrap();
        assert_eq!(report.expired, 3);
    }

    #[tokio::test]
    async fn test_run_sweeps_at_start_and_on_each_trigger() {
        let store = InMemoryPendingPaymentStore::new();
        let audit = InMemoryAuditTrail::new();
        let clock = ManualClock::default();
        seed(&store, &clock, "BACKLOG", -1).await;

        let (fire, trigger) = ManualTrigger::channel(4);
        let (_stop, shutdown) = watch::channel(false);
        let sweeper = sweeper(&store, &audit, &clock);

        seed(&store, &clock, "LATER", 1).await;
        clock.advance(ChronoDuration::hours(2));
        fire.send(()).await.unwrap();
        drop(fire);

        let reports = sweeper.run(trigger, shutdown).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().map(|r| r.expired).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryPendingPaymentStore::new();
        let audit = InMemoryAuditTrail::new();
        let clock = ManualClock::default();
        let sweeper = Arc::new(sweeper(&store, &audit, &clock));

        let (stop, shutdown) = watch::channel(false);
        let handle = {
            let sweeper = Arc::clone(&sweeper);
            tokio::spawn(async move { sweeper.run(IntervalTrigger::daily(), shutdown).await })
        };
        stop.send(true).unwrap();
        let reports = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
        assert!(!reports.is_empty());
    }
}
