use super::money::Amount;
use crate::error::PaymentError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a pending payment.
///
/// `Paid` and `Expired` are final. `ManualReview` only leaves through an
/// explicit, human-confirmed `ConfirmReviewed` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    #[serde(alias = "pendiente")]
    Pending,
    #[serde(alias = "pagado")]
    Paid,
    #[serde(alias = "caducado")]
    Expired,
    #[serde(alias = "revision_manual")]
    ManualReview,
}

impl PaymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Paid => "paid",
            PaymentState::Expired => "expired",
            PaymentState::ManualReview => "manual_review",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, PaymentState::Paid | PaymentState::Expired)
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every state change a pending payment can undergo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Observed amount matched; the reference is settled.
    Settle,
    /// Observed confirmation did not match; a human must decide.
    FlagForReview,
    /// Validity window elapsed without settlement.
    Expire,
    /// A privileged actor explicitly accepted a flagged payment.
    ConfirmReviewed,
}

impl Transition {
    /// The transition table: the single state each transition may start from,
    /// and the state it leads to.
    pub fn edge(self) -> (PaymentState, PaymentState) {
        match self {
            Transition::Settle => (PaymentState::Pending, PaymentState::Paid),
            Transition::FlagForReview => (PaymentState::Pending, PaymentState::ManualReview),
            Transition::Expire => (PaymentState::Pending, PaymentState::Expired),
            Transition::ConfirmReviewed => (PaymentState::ManualReview, PaymentState::Paid),
        }
    }

    pub fn from_state(self) -> PaymentState {
        self.edge().0
    }

    pub fn to_state(self) -> PaymentState {
        self.edge().1
    }

    fn settles(self) -> bool {
        self.to_state() == PaymentState::Paid
    }
}

/// One outstanding settlement expectation, keyed externally by `reference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayment {
    pub id: Uuid,
    pub reference: String,
    pub student_id: String,
    pub concept_id: String,
    pub debt_id: Option<String>,
    pub expected_amount: Amount,
    pub created_at: DateTime<Utc>,
    pub expiration_timestamp: DateTime<Utc>,
    pub state: PaymentState,
    pub observations: String,
    pub linked_payment_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl PendingPayment {
    pub fn new(
        reference: String,
        student_id: String,
        concept_id: String,
        debt_id: Option<String>,
        expected_amount: Amount,
        created_at: DateTime<Utc>,
        expiration_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference,
            student_id,
            concept_id,
            debt_id,
            expected_amount,
            created_at,
            expiration_timestamp,
            state: PaymentState::Pending,
            observations: String::new(),
            linked_payment_id: None,
            updated_at: created_at,
        }
    }

    /// Whether the validity window has elapsed at `now`.
    pub fn is_past_expiration(&self, now: DateTime<Utc>) -> bool {
        self.expiration_timestamp < now
    }

    /// Whether the sweeper should expire this row at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == PaymentState::Pending && self.is_past_expiration(now)
    }

    /// Appends a timestamped note. Existing observations are never rewritten.
    pub fn append_observation(&mut self, note: &str, at: DateTime<Utc>) {
        if !self.observations.is_empty() {
            self.observations.push('\n');
        }
        self.observations.push_str(&format!(
            "[{}] {}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            note
        ));
        self.updated_at = at;
    }

    /// Applies `transition` after checking it against the transition table.
    ///
    /// Settling transitions must carry the id of the payment record they
    /// produced; it becomes `linked_payment_id`.
    pub fn apply(
        &mut self,
        transition: Transition,
        linked_payment_id: Option<Uuid>,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        let (from, to) = transition.edge();
        if self.state != from {
            return Err(PaymentError::IllegalTransition {
                transition,
                from: self.state,
            });
        }
        match (transition.settles(), linked_payment_id) {
            (true, Some(payment_id)) => self.linked_payment_id = Some(payment_id),
            (true, None) => {
                return Err(PaymentError::ValidationError(
                    "Settlement requires a linked payment".to_string(),
                ));
            }
            (false, Some(_)) => {
                return Err(PaymentError::ValidationError(format!(
                    "{:?} cannot link a payment",
                    transition
                )));
            }
            (false, None) => {}
        }
        self.state = to;
        self.append_observation(note, at);
        Ok(())
    }
}
