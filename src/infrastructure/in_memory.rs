use crate::domain::audit::AuditRecord;
use crate::domain::pending_payment::PendingPayment;
use crate::domain::ports::{
    AuditTrail, BillingGateway, Claim, Notifier, PendingPaymentStore, ReceiptRenderer,
    StateChange, TransitionOutcome, WebhookLedger, lease_lapsed,
};
use crate::domain::settlement::{PaymentSettled, SettledPayment};
use crate::domain::webhook::IngestResult;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct PendingState {
    sequence: u64,
    payments: HashMap<Uuid, PendingPayment>,
    by_reference: HashMap<String, Uuid>,
    settled: HashMap<Uuid, SettledPayment>,
    by_transaction: HashMap<String, Uuid>,
}

/// A thread-safe in-memory store for pending payments and their settlements.
///
/// All rows live behind one `RwLock`, so a transition's state check and its
/// write happen under the same write guard.
#[derive(Default, Clone)]
pub struct InMemoryPendingPaymentStore {
    state: Arc<RwLock<PendingState>>,
}

impl InMemoryPendingPaymentStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<PendingPayment> {
        self.state.read().await.payments.values().cloned().collect()
    }

    pub async fn settlement_count(&self) -> usize {
        self.state.read().await.settled.len()
    }
}

#[async_trait]
impl PendingPaymentStore for InMemoryPendingPaymentStore {
    async fn next_sequence(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        state.sequence += 1;
        Ok(state.sequence)
    }

    async fn insert(&self, payment: PendingPayment) -> Result<()> {
        let mut state = self.state.write().await;
        if state.by_reference.contains_key(&payment.reference) {
            return Err(PaymentError::Conflict(format!(
                "Reference {} already issued",
                payment.reference
            )));
        }
        if state.payments.contains_key(&payment.id) {
            return Err(PaymentError::Conflict(format!(
                "Pending payment {} already exists",
                payment.id
            )));
        }
        state.by_reference.insert(payment.reference.clone(), payment.id);
        state.payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PendingPayment>> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PendingPayment>> {
        let state = self.state.read().await;
        Ok(state
            .by_reference
            .get(reference)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn transition(&self, id: Uuid, change: StateChange) -> Result<TransitionOutcome> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let current = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| PaymentError::NotFound(format!("Pending payment {}", id)))?;

        if current.state != change.expected {
            return Ok(TransitionOutcome::Conflict(current.clone()));
        }
        if let Some(tx) = change
            .settlement
            .as_ref()
            .and_then(|p| p.external_transaction_id.as_ref())
        {
            if state.by_transaction.contains_key(tx) {
                return Err(PaymentError::TransactionAlreadyApplied(tx.clone()));
            }
        }

        let mut updated = current.clone();
        updated.apply(
            change.transition,
            change.settlement.as_ref().map(|p| p.id),
            &change.note,
            change.at,
        )?;

        if let Some(payment) = change.settlement {
            if let Some(tx) = &payment.external_transaction_id {
                state.by_transaction.insert(tx.clone(), payment.id);
            }
            state.settled.insert(payment.id, payment);
        }
        *current = updated.clone();
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn append_observation(
        &self,
        id: Uuid,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<PendingPayment> {
        let mut state = self.state.write().await;
        let current = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| PaymentError::NotFound(format!("Pending payment {}", id)))?;
        current.append_observation(note, at);
        Ok(current.clone())
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<PendingPayment>> {
        let state = self.state.read().await;
        let mut overdue: Vec<PendingPayment> = state
            .payments
            .values()
            .filter(|p| p.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|p| p.expiration_timestamp);
        Ok(overdue)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<SettledPayment>> {
        Ok(self.state.read().await.settled.get(&payment_id).cloned())
    }

    async fn payment_for_transaction(&self, transaction_id: &str) -> Result<Option<SettledPayment>> {
        let state = self.state.read().await;
        Ok(state
            .by_transaction
            .get(transaction_id)
            .and_then(|id| state.settled.get(id))
            .cloned())
    }

    async fn attach_receipt(&self, payment_id: Uuid, receipt_url: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let payment = state
            .settled
            .get_mut(&payment_id)
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {}", payment_id)))?;
        payment.receipt_url = Some(receipt_url.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum LedgerEntry {
    InFlight { claimed_at: DateTime<Utc> },
    Completed(IngestResult),
}

/// In-memory deduplication ledger keyed by bank transaction id.
#[derive(Default, Clone)]
pub struct InMemoryWebhookLedger {
    entries: Arc<RwLock<HashMap<String, LedgerEntry>>>,
}

impl InMemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookLedger for InMemoryWebhookLedger {
    async fn claim(
        &self,
        transaction_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Claim> {
        let mut entries = self.entries.write().await;
        match entries.get(transaction_id) {
            Some(LedgerEntry::Completed(result)) => Ok(Claim::Completed(result.clone())),
            Some(LedgerEntry::InFlight { claimed_at }) if !lease_lapsed(*claimed_at, now, lease) => {
                Ok(Claim::InFlight)
            }
            _ => {
                entries.insert(
                    transaction_id.to_string(),
                    LedgerEntry::InFlight { claimed_at: now },
                );
                Ok(Claim::Claimed)
            }
        }
    }

    async fn complete(&self, transaction_id: &str, result: IngestResult) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(transaction_id.to_string(), LedgerEntry::Completed(result));
        Ok(())
    }

    async fn release(&self, transaction_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if matches!(entries.get(transaction_id), Some(LedgerEntry::InFlight { .. })) {
            entries.remove(transaction_id);
        }
        Ok(())
    }
}

/// Append-only in-memory audit log.
#[derive(Default, Clone)]
pub struct InMemoryAuditTrail {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn records_for(&self, subject: &str) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.subject == subject)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.read().await.clone())
    }
}

#[derive(Default)]
struct BillingState {
    accept_all: bool,
    concepts: HashSet<String>,
    debts: HashSet<String>,
    paid_debts: HashMap<String, Uuid>,
}

/// Stand-in for the billing domain. Either knows an explicit set of concepts
/// and debts, or accepts any id.
#[derive(Default, Clone)]
pub struct InMemoryBilling {
    state: Arc<RwLock<BillingState>>,
}

impl InMemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_all() -> Self {
        Self {
            state: Arc::new(RwLock::new(BillingState {
                accept_all: true,
                ..Default::default()
            })),
        }
    }

    pub async fn add_concept(&self, concept_id: &str) {
        self.state.write().await.concepts.insert(concept_id.to_string());
    }

    pub async fn add_debt(&self, debt_id: &str) {
        self.state.write().await.debts.insert(debt_id.to_string());
    }

    pub async fn debt_payment(&self, debt_id: &str) -> Option<Uuid> {
        self.state.read().await.paid_debts.get(debt_id).copied()
    }
}

#[async_trait]
impl BillingGateway for InMemoryBilling {
    async fn concept_exists(&self, concept_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.accept_all || state.concepts.contains(concept_id))
    }

    async fn debt_exists(&self, debt_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.accept_all || state.debts.contains(debt_id))
    }

    async fn mark_debt_paid(&self, debt_id: &str, payment_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.accept_all && !state.debts.contains(debt_id) {
            return Err(PaymentError::NotFound(format!("Debt {}", debt_id)));
        }
        state.paid_debts.insert(debt_id.to_string(), payment_id);
        Ok(())
    }
}

/// Receipt renderer that records what it rendered and hands back a
/// deterministic location.
#[derive(Default, Clone)]
pub struct RecordingReceiptRenderer {
    rendered: Arc<RwLock<Vec<PaymentSettled>>>,
}

impl RecordingReceiptRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rendered(&self) -> Vec<PaymentSettled> {
        self.rendered.read().await.clone()
    }
}

#[async_trait]
impl ReceiptRenderer for RecordingReceiptRenderer {
    async fn render(&self, event: &PaymentSettled) -> Result<String> {
        self.rendered.write().await.push(event.clone());
        Ok(format!("receipts/{}.pdf", event.payment_id))
    }
}

/// Notifier that records each notification instead of sending email.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<(Uuid, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(Uuid, String)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn payment_settled(&self, event: &PaymentSettled, receipt_url: &str) -> Result<()> {
        tracing::info!(
            payment_id = %event.payment_id,
            student_id = %event.student_id,
            receipt_url,
            "Payment notification queued"
        );
        self.sent
            .write()
            .await
            .push((event.payment_id, receipt_url.to_string()));
        Ok(())
    }
}
