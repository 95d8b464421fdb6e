use super::actor::Actor;
use super::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The payment record created when a reference settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledPayment {
    pub id: Uuid,
    pub pending_payment_id: Uuid,
    pub reference: String,
    pub student_id: String,
    pub concept_id: String,
    pub debt_id: Option<String>,
    pub amount: Amount,
    pub payment_date: DateTime<Utc>,
    pub external_transaction_id: Option<String>,
    pub settled_by: Actor,
    pub settled_at: DateTime<Utc>,
    pub receipt_url: Option<String>,
}

impl SettledPayment {
    pub fn event(&self) -> PaymentSettled {
        PaymentSettled {
            payment_id: self.id,
            student_id: self.student_id.clone(),
            concept_id: self.concept_id.clone(),
            amount: self.amount,
            payment_date: self.payment_date,
        }
    }
}

/// Emitted exactly once per settlement. Receipt rendering and the
/// notification email hang off this event and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSettled {
    pub payment_id: Uuid,
    pub student_id: String,
    pub concept_id: String,
    pub amount: Amount,
    pub payment_date: DateTime<Utc>,
}
