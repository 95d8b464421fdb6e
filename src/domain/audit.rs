use super::actor::Actor;
use super::pending_payment::PaymentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ReferenceGenerated,
    Reconcile,
    ConfirmPayment,
    WebhookIngest,
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One append-only audit entry. Rejected attempts are recorded as well as
/// successful ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Reference, pending payment id or transaction id the record is about.
    pub subject: String,
    pub before_state: Option<PaymentState>,
    pub after_state: Option<PaymentState>,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        actor: &Actor,
        timestamp: DateTime<Utc>,
        subject: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.clone(),
            timestamp,
            subject: subject.into(),
            before_state: None,
            after_state: None,
            details: serde_json::Value::Null,
            outcome,
        }
    }

    pub fn with_states(
        mut self,
        before: Option<PaymentState>,
        after: Option<PaymentState>,
    ) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
