use super::money::Amount;
use super::pending_payment::PaymentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single confirmation submitted for reconciliation, whether it came from a
/// bank webhook, a statement row or a manual confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationAttempt {
    pub reference: String,
    pub observed_amount: Amount,
    pub observed_date: DateTime<Utc>,
    pub external_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Settle a still-pending reference even though its validity window has
    /// elapsed. Never revives an `Expired` row.
    pub accept_late: bool,
    /// The attempt is an explicit confirmation by a privileged human, which
    /// may also settle a reference sitting in manual review.
    pub human_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub reference: String,
    pub pending_payment_id: Uuid,
    pub state: PaymentState,
    pub payment_id: Option<Uuid>,
    pub requires_manual_review: bool,
    /// The reference was already paid; nothing new was settled.
    pub already_settled: bool,
}

impl ReconciliationResult {
    pub fn settled(&self) -> bool {
        self.state == PaymentState::Paid
    }
}
