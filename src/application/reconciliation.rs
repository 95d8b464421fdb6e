use super::audit::Auditor;
use super::bounded;
use crate::config::DEFAULT_STORE_TIMEOUT_MS;
use crate::domain::actor::Actor;
use crate::domain::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::domain::clock::ClockRef;
use crate::domain::pending_payment::{PaymentState, PendingPayment, Transition};
use crate::domain::ports::{
    AuditTrailRef, BillingGatewayRef, EventSinkRef, PendingPaymentStoreRef, StateChange,
    TransitionOutcome,
};
use crate::domain::reconciliation::{ReconcileOptions, ReconciliationAttempt, ReconciliationResult};
use crate::domain::settlement::SettledPayment;
use crate::error::{PaymentError, Result};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// How a caller identifies the pending payment to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLookup {
    Id(Uuid),
    Reference(String),
}

impl PaymentLookup {
    /// Treats anything that parses as a UUID as an id, otherwise a reference.
    pub fn parse(text: &str) -> Self {
        match Uuid::parse_str(text.trim()) {
            Ok(id) => PaymentLookup::Id(id),
            Err(_) => PaymentLookup::Reference(text.trim().to_string()),
        }
    }
}

/// Bounded retries when a compare-and-swap loses to a concurrent writer.
/// Transitions are monotonic, so a row can only move a couple of times.
const MAX_CAS_ROUNDS: usize = 3;

/// Result of evaluating one call, before its single audit record is written.
struct Step {
    outcome: Result<ReconciliationResult>,
    record: AuditRecord,
    settled: Option<(SettledPayment, Option<String>)>,
}

/// Decides the settlement outcome of a confirmation and drives the state
/// machine accordingly.
///
/// Every call writes exactly one audit record, whatever the outcome. A
/// settlement publishes one `PaymentSettled` event; idempotent replays
/// publish nothing.
pub struct ReconciliationEngine {
    store: PendingPaymentStoreRef,
    billing: BillingGatewayRef,
    events: EventSinkRef,
    auditor: Auditor,
    clock: ClockRef,
    timeout: Duration,
    accept_late: bool,
}

impl ReconciliationEngine {
    pub fn new(
        store: PendingPaymentStoreRef,
        billing: BillingGatewayRef,
        events: EventSinkRef,
        audit: AuditTrailRef,
        clock: ClockRef,
    ) -> Self {
        let timeout = Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS);
        Self {
            store,
            billing,
            events,
            auditor: Auditor::new(audit, timeout),
            clock,
            timeout,
            accept_late: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.auditor = self.auditor.with_timeout(timeout);
        self
    }

    /// Default for `ReconcileOptions::accept_late` on confirmations and
    /// webhook deliveries.
    pub fn with_late_acceptance(mut self, accept_late: bool) -> Self {
        self.accept_late = accept_late;
        self
    }

    pub fn accepts_late(&self) -> bool {
        self.accept_late
    }

    /// Reconciles an observed confirmation against the pending payment it
    /// names.
    pub async fn reconcile(
        &self,
        attempt: ReconciliationAttempt,
        actor: &Actor,
        options: ReconcileOptions,
    ) -> Result<ReconciliationResult> {
        let action = if options.human_confirmed {
            AuditAction::ConfirmPayment
        } else {
            AuditAction::Reconcile
        };

        if let Some(step) = self.authorize(actor, action, &attempt.reference) {
            return self.finish(step).await;
        }

        let step = match self.lookup_reference(&attempt.reference).await {
            Ok(Some(row)) => self.evaluate(row, &attempt, actor, options, action).await,
            Ok(None) => self.not_found(&attempt.reference, &attempt, actor, action),
            Err(e) => self.failed(&attempt.reference, &attempt, actor, action, e),
        };
        self.finish(step).await
    }

    /// Privileged confirmation that the expected amount arrived now. May
    /// settle a reference held in manual review.
    pub async fn confirm_payment(
        &self,
        lookup: PaymentLookup,
        actor: &Actor,
    ) -> Result<ReconciliationResult> {
        let action = AuditAction::ConfirmPayment;
        let subject = match &lookup {
            PaymentLookup::Id(id) => id.to_string(),
            PaymentLookup::Reference(reference) => reference.clone(),
        };

        if let Some(step) = self.authorize(actor, action, &subject) {
            return self.finish(step).await;
        }

        let found = match &lookup {
            PaymentLookup::Id(id) => bounded(self.timeout, "pending payment lookup", self.store.get(*id)).await,
            PaymentLookup::Reference(reference) => self.lookup_reference(reference).await,
        };

        let step = match found {
            Ok(Some(row)) => {
                let attempt = ReconciliationAttempt {
                    reference: row.reference.clone(),
                    observed_amount: row.expected_amount,
                    observed_date: self.clock.now(),
                    external_transaction_id: None,
                };
                let options = ReconcileOptions {
                    accept_late: self.accept_late,
                    human_confirmed: true,
                };
                self.evaluate(row, &attempt, actor, options, action).await
            }
            Ok(None) => Step {
                outcome: Err(PaymentError::ReferenceNotFound(subject.clone())),
                record: AuditRecord::new(action, actor, self.clock.now(), &subject, AuditOutcome::Failure)
                    .with_details(json!({ "reason": "not_found" })),
                settled: None,
            },
            Err(e) => Step {
                record: AuditRecord::new(action, actor, self.clock.now(), &subject, AuditOutcome::Failure)
                    .with_details(json!({ "reason": "store_error", "error": e.to_string() })),
                outcome: Err(e),
                settled: None,
            },
        };
        self.finish(step).await
    }

    async fn lookup_reference(&self, reference: &str) -> Result<Option<PendingPayment>> {
        bounded(
            self.timeout,
            "reference lookup",
            self.store.find_by_reference(reference),
        )
        .await
    }

    fn authorize(&self, actor: &Actor, action: AuditAction, subject: &str) -> Option<Step> {
        if actor.is_privileged() {
            return None;
        }
        tracing::warn!(%actor, %subject, "Unprivileged actor attempted to reconcile");
        Some(Step {
            outcome: Err(PaymentError::Unauthorized(format!(
                "Actor {} may not reconcile payments",
                actor
            ))),
            record: AuditRecord::new(action, actor, self.clock.now(), subject, AuditOutcome::Failure)
                .with_details(json!({ "reason": "unprivileged_actor" })),
            settled: None,
        })
    }

    fn not_found(
        &self,
        reference: &str,
        attempt: &ReconciliationAttempt,
        actor: &Actor,
        action: AuditAction,
    ) -> Step {
        tracing::warn!(%reference, "Reconciliation for unknown reference");
        Step {
            outcome: Err(PaymentError::ReferenceNotFound(reference.to_string())),
            record: AuditRecord::new(action, actor, self.clock.now(), reference, AuditOutcome::Failure)
                .with_details(attempt_details(attempt, "not_found")),
            settled: None,
        }
    }

    fn failed(
        &self,
        reference: &str,
        attempt: &ReconciliationAttempt,
        actor: &Actor,
        action: AuditAction,
        error: PaymentError,
    ) -> Step {
        tracing::warn!(%reference, %error, "Reconciliation aborted by store error");
        let mut details = attempt_details(attempt, "store_error");
        details["error"] = json!(error.to_string());
        Step {
            outcome: Err(error),
            record: AuditRecord::new(action, actor, self.clock.now(), reference, AuditOutcome::Failure)
                .with_details(details),
            settled: None,
        }
    }

    /// Walks the state machine for one attempt. Lost compare-and-swap races are
    /// re-evaluated against the row the winner left behind.
    async fn evaluate(
        &self,
        mut row: PendingPayment,
        attempt: &ReconciliationAttempt,
        actor: &Actor,
        options: ReconcileOptions,
        action: AuditAction,
    ) -> Step {
        let before = row.state;
        if let Some(tx) = &attempt.external_transaction_id {
            let prior = bounded(
                self.timeout,
                "transaction lookup",
                self.store.payment_for_transaction(tx),
            )
            .await;
            match prior {
                Ok(Some(prior)) if prior.pending_payment_id != row.id => {
                    return self.transaction_reused(&row, attempt, actor, action, Some(prior.id));
                }
                Ok(_) => {}
                Err(e) => return self.failed(&attempt.reference, attempt, actor, action, e),
            }
        }

        for _ in 0..MAX_CAS_ROUNDS {
            let now = self.clock.now();
            let record = |outcome: AuditOutcome, after: PaymentState, reason: &str| {
                AuditRecord::new(action, actor, now, &attempt.reference, outcome)
                    .with_states(Some(before), Some(after))
                    .with_details(attempt_details(attempt, reason))
            };

            match row.state {
                PaymentState::Paid => {
                    tracing::info!(reference = %row.reference, "Reference already paid, replaying settlement");
                    return Step {
                        outcome: Ok(result_for(&row, true)),
                        record: record(AuditOutcome::Success, PaymentState::Paid, "already_paid"),
                        settled: None,
                    };
                }
                PaymentState::Expired => {
                    self.note_late_attempt(&row, attempt, now).await;
                    return Step {
                        outcome: Err(PaymentError::ReferenceExpired(row.reference.clone())),
                        record: record(AuditOutcome::Failure, PaymentState::Expired, "expired"),
                        settled: None,
                    };
                }
                PaymentState::ManualReview if !options.human_confirmed => {
                    tracing::info!(reference = %row.reference, "Reference awaits manual review");
                    return Step {
                        outcome: Ok(result_for(&row, false)),
                        record: record(AuditOutcome::Success, PaymentState::ManualReview, "awaiting_manual_review"),
                        settled: None,
                    };
                }
                PaymentState::Pending
                    if row.is_past_expiration(now) && !options.accept_late =>
                {
                    self.note_late_attempt(&row, attempt, now).await;
                    return Step {
                        outcome: Err(PaymentError::ReferenceExpired(row.reference.clone())),
                        record: record(AuditOutcome::Failure, PaymentState::Pending, "past_expiration"),
                        settled: None,
                    };
                }
                PaymentState::Pending if attempt.observed_amount != row.expected_amount => {
                    let note = format!(
                        "Amount mismatch: expected {}, observed {} (transaction {}). Sent to manual review.",
                        row.expected_amount,
                        attempt.observed_amount,
                        attempt.external_transaction_id.as_deref().unwrap_or("n/a"),
                    );
                    let change = StateChange::new(Transition::FlagForReview, note, now);
                    match self.apply(row.id, change).await {
                        Ok(TransitionOutcome::Applied(updated)) => {
                            tracing::warn!(
                                reference = %updated.reference,
                                expected = %updated.expected_amount,
                                observed = %attempt.observed_amount,
                                "Amount mismatch, flagged for manual review"
                            );
                            return Step {
                                outcome: Ok(result_for(&updated, false)),
                                record: record(AuditOutcome::Success, PaymentState::ManualReview, "amount_mismatch"),
                                settled: None,
                            };
                        }
                        Ok(TransitionOutcome::Conflict(current)) => row = current,
                        Err(e) => return self.failed(&attempt.reference, attempt, actor, action, e),
                    }
                }
                PaymentState::Pending | PaymentState::ManualReview => {
                    let transition = if row.state == PaymentState::Pending {
                        Transition::Settle
                    } else {
                        Transition::ConfirmReviewed
                    };
                    let payment = SettledPayment {
                        id: Uuid::new_v4(),
                        pending_payment_id: row.id,
                        reference: row.reference.clone(),
                        student_id: row.student_id.clone(),
                        concept_id: row.concept_id.clone(),
                        debt_id: row.debt_id.clone(),
                        amount: attempt.observed_amount,
                        payment_date: attempt.observed_date,
                        external_transaction_id: attempt.external_transaction_id.clone(),
                        settled_by: actor.clone(),
                        settled_at: now,
                        receipt_url: None,
                    };
                    let note = format!(
                        "Settled by {} with payment {} for {}",
                        actor, payment.id, attempt.observed_amount
                    );
                    let change = StateChange::new(transition, note, now).with_settlement(payment.clone());
                    match self.apply(row.id, change).await {
                        Ok(TransitionOutcome::Applied(updated)) => {
                            tracing::info!(
                                reference = %updated.reference,
                                payment_id = %payment.id,
                                amount = %payment.amount,
                                "Payment settled"
                            );
                            return Step {
                                outcome: Ok(result_for(&updated, false)),
                                record: record(AuditOutcome::Success, PaymentState::Paid, "settled"),
                                settled: Some((payment, updated.debt_id.clone())),
                            };
                        }
                        Ok(TransitionOutcome::Conflict(current)) => row = current,
                        Err(PaymentError::TransactionAlreadyApplied(_)) => {
                            return self.transaction_reused(&row, attempt, actor, action, None);
                        }
                        Err(e) => return self.failed(&attempt.reference, attempt, actor, action, e),
                    }
                }
            }
        }

        self.failed(
            &attempt.reference,
            attempt,
            actor,
            action,
            PaymentError::Conflict(format!(
                "Reference {} kept changing under reconciliation",
                attempt.reference
            )),
        )
    }

    /// The attempt carries a bank transaction id that already settled a
    /// different pending payment. Nothing is written to `row`.
    fn transaction_reused(
        &self,
        row: &PendingPayment,
        attempt: &ReconciliationAttempt,
        actor: &Actor,
        action: AuditAction,
        prior_payment_id: Option<Uuid>,
    ) -> Step {
        let tx = attempt.external_transaction_id.clone().unwrap_or_default();
        tracing::warn!(
            reference = %row.reference,
            transaction_id = %tx,
            "Bank transaction already settled another reference"
        );
        let mut details = attempt_details(attempt, "transaction_already_applied");
        details["priorPaymentId"] = json!(prior_payment_id);
        Step {
            outcome: Err(PaymentError::TransactionAlreadyApplied(tx)),
            record: AuditRecord::new(action, actor, self.clock.now(), &attempt.reference, AuditOutcome::Failure)
                .with_states(Some(row.state), Some(row.state))
                .with_details(details),
            settled: None,
        }
    }

    async fn apply(&self, id: Uuid, change: StateChange) -> Result<TransitionOutcome> {
        bounded(self.timeout, "state transition", self.store.transition(id, change)).await
    }

    async fn note_late_attempt(
        &self,
        row: &PendingPayment,
        attempt: &ReconciliationAttempt,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        tracing::warn!(reference = %row.reference, state = %row.state, "Late payment attempt rejected");
        let note = format!(
            "Late payment attempt rejected: {} observed on {} (transaction {})",
            attempt.observed_amount,
            attempt.observed_date.to_rfc3339(),
            attempt.external_transaction_id.as_deref().unwrap_or("n/a"),
        );
        let appended = bounded(
            self.timeout,
            "observation append",
            self.store.append_observation(row.id, &note, now),
        )
        .await;
        if let Err(e) = appended {
            tracing::warn!(reference = %row.reference, error = %e, "Could not record late attempt");
        }
    }

    /// Writes the step's audit record, then runs post-settlement side effects.
    async fn finish(&self, step: Step) -> Result<ReconciliationResult> {
        let audited = self.auditor.record(step.record).await;

        if let Some((payment, debt_id)) = step.settled {
            if let Some(debt_id) = debt_id {
                let marked = bounded(
                    self.timeout,
                    "debt update",
                    self.billing.mark_debt_paid(&debt_id, payment.id),
                )
                .await;
                if let Err(e) = marked {
                    tracing::error!(%debt_id, payment_id = %payment.id, error = %e, "Failed to mark debt as paid");
                }
            }
            if let Err(e) = self.events.publish(payment.event()).await {
                tracing::error!(payment_id = %payment.id, error = %e, "Failed to publish PaymentSettled");
            }
        }

        match (step.outcome, audited) {
            (Ok(result), Err(source)) => Err(PaymentError::AuditWriteFailed {
                outcome: Box::new(result),
                source: Box::new(source),
            }),
            (outcome, _) => outcome,
        }
    }
}

fn result_for(row: &PendingPayment, already_settled: bool) -> ReconciliationResult {
    ReconciliationResult {
        reference: row.reference.clone(),
        pending_payment_id: row.id,
        state: row.state,
        payment_id: row.linked_payment_id,
        requires_manual_review: row.state == PaymentState::ManualReview,
        already_settled,
    }
}

fn attempt_details(attempt: &ReconciliationAttempt, reason: &str) -> serde_json::Value {
    json!({
        "reason": reason,
        "observedAmount": attempt.observed_amount,
        "observedDate": attempt.observed_date,
        "externalTransactionId": attempt.external_transaction_id,
    })
}
