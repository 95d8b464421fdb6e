use super::audit::AuditRecord;
use super::pending_payment::{PaymentState, PendingPayment, Transition};
use super::settlement::{PaymentSettled, SettledPayment};
use super::webhook::IngestResult;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// A conditional state change, applied only if the row is still in
/// `expected` when the store takes its write lock.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub transition: Transition,
    pub expected: PaymentState,
    pub note: String,
    pub at: DateTime<Utc>,
    /// Written in the same atomic step when the transition settles.
    pub settlement: Option<SettledPayment>,
}

impl StateChange {
    pub fn new(transition: Transition, note: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            transition,
            expected: transition.from_state(),
            note: note.into(),
            at,
            settlement: None,
        }
    }

    pub fn with_settlement(mut self, payment: SettledPayment) -> Self {
        self.settlement = Some(payment);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(PendingPayment),
    /// The row had already moved on; carries its current value.
    Conflict(PendingPayment),
}

#[async_trait]
pub trait PendingPaymentStore: Send + Sync {
    /// Monotonically increasing, never reused, survives restarts where the
    /// backend is durable.
    async fn next_sequence(&self) -> Result<u64>;
    /// Fails with `Conflict` if the reference was ever issued before.
    async fn insert(&self, payment: PendingPayment) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<PendingPayment>>;
    async fn find_by_reference(&self, reference: &str) -> Result<Option<PendingPayment>>;
    /// Compare-and-swap on the current state. Fails with `NotFound` for an
    /// unknown id, and with `TransactionAlreadyApplied` when the settlement
    /// carries a bank transaction id that already settled another payment.
    async fn transition(&self, id: Uuid, change: StateChange) -> Result<TransitionOutcome>;
    async fn append_observation(
        &self,
        id: Uuid,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<PendingPayment>;
    /// Rows in `Pending` whose expiration timestamp is before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<PendingPayment>>;
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<SettledPayment>>;
    /// The settlement recorded for a bank transaction id, if any.
    async fn payment_for_transaction(&self, transaction_id: &str) -> Result<Option<SettledPayment>>;
    async fn attach_receipt(&self, payment_id: Uuid, receipt_url: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns this transaction id until it completes or releases it,
    /// or until its lease lapses.
    Claimed,
    /// Another delivery of the same transaction id holds a live claim.
    InFlight,
    /// Already ingested; carries the recorded result.
    Completed(IngestResult),
}

/// Deduplication ledger for bank transaction ids.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Claims `transaction_id` at `now`. An in-flight claim older than
    /// `lease` is treated as abandoned and handed to the caller.
    async fn claim(
        &self,
        transaction_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Claim>;
    async fn complete(&self, transaction_id: &str, result: IngestResult) -> Result<()>;
    async fn release(&self, transaction_id: &str) -> Result<()>;
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;
    async fn records_for(&self, subject: &str) -> Result<Vec<AuditRecord>>;
    async fn all(&self) -> Result<Vec<AuditRecord>>;
}

/// The billing domain that owns students, concepts and debts.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn concept_exists(&self, concept_id: &str) -> Result<bool>;
    async fn debt_exists(&self, debt_id: &str) -> Result<bool>;
    async fn mark_debt_paid(&self, debt_id: &str, payment_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: PaymentSettled) -> Result<()>;
}

/// Renders a receipt for a settled payment and returns where it can be fetched.
#[async_trait]
pub trait ReceiptRenderer: Send + Sync {
    async fn render(&self, event: &PaymentSettled) -> Result<String>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn payment_settled(&self, event: &PaymentSettled, receipt_url: &str) -> Result<()>;
}

pub type PendingPaymentStoreRef = Arc<dyn PendingPaymentStore>;
pub type WebhookLedgerRef = Arc<dyn WebhookLedger>;
pub type AuditTrailRef = Arc<dyn AuditTrail>;
pub type BillingGatewayRef = Arc<dyn BillingGateway>;
pub type EventSinkRef = Arc<dyn EventSink>;
pub type ReceiptRendererRef = Arc<dyn ReceiptRenderer>;
pub type NotifierRef = Arc<dyn Notifier>;

/// Whether an in-flight claim taken at `claimed_at` has been abandoned by `now`.
pub fn lease_lapsed(
    claimed_at: DateTime<Utc>,
    now: DateTime<Utc>,
    lease: chrono::Duration,
) -> bool {
    claimed_at
        .checked_add_signed(lease)
        .is_some_and(|deadline| deadline <= now)
}
