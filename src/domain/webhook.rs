use super::money::Amount;
use super::reconciliation::ReconciliationAttempt;
use crate::error::PaymentError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Response code returned to the bank. Its retry logic keys off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookCode {
    PaymentProcessed,
    AlreadyPaid,
    ReferenceExpired,
    ReferenceNotFound,
    Unauthorized,
    InvalidPayload,
    ReconciliationError,
    InternalError,
}

impl WebhookCode {
    pub fn is_success(self) -> bool {
        matches!(self, WebhookCode::PaymentProcessed | WebhookCode::AlreadyPaid)
    }
}

/// How the sender authenticated the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookCredential {
    /// `sha256=<hex>` HMAC of the raw body.
    Signature(String),
    ApiKey(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub success: bool,
    pub code: WebhookCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_manual_review: bool,
    /// Replayed from a previous delivery of the same transaction id.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IngestResult {
    pub fn new(code: WebhookCode) -> Self {
        Self {
            success: code.is_success(),
            code,
            payment_id: None,
            requires_manual_review: false,
            duplicate: false,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The answer given to a re-delivery of an already ingested transaction.
    pub fn replayed(&self) -> Self {
        let mut replay = self.clone();
        if replay.code == WebhookCode::PaymentProcessed {
            replay.code = WebhookCode::AlreadyPaid;
        }
        replay.duplicate = true;
        replay
    }

    /// Outcomes that settle the question for this transaction id. Anything
    /// else may succeed on a later delivery.
    pub fn is_definitive(&self) -> bool {
        !matches!(
            self.code,
            WebhookCode::InternalError | WebhookCode::Unauthorized | WebhookCode::InvalidPayload
        )
    }
}

/// A validated bank confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub reference: String,
    pub amount: Amount,
    pub payment_date: DateTime<Utc>,
    pub transaction_id: String,
    pub bank_name: Option<String>,
    pub account_from: Option<String>,
}

impl WebhookPayload {
    /// Parses and validates the raw body. All missing required fields are
    /// reported together. Numeric fields are taken from their JSON token as
    /// written, so amounts keep every digit the bank sent.
    pub fn parse(raw: &[u8]) -> Result<Self, PaymentError> {
        let body = std::str::from_utf8(raw)
            .map_err(|e| PaymentError::InvalidPayload(format!("Body is not UTF-8: {}", e)))?;
        let object: HashMap<String, &RawValue> = serde_json::from_str(body).map_err(|e| {
            PaymentError::InvalidPayload(format!("Expected a JSON object: {}", e))
        })?;

        let text = |key: &str| -> Option<String> {
            let token = object.get(key)?.get().trim();
            if token.starts_with('"') {
                let value: String = serde_json::from_str(token).ok()?;
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else if token.starts_with(|c: char| c == '-' || c.is_ascii_digit()) {
                Some(token.to_string())
            } else {
                None
            }
        };

        let reference = text("reference");
        let amount = text("amount");
        let payment_date = text("paymentDate");
        let transaction_id = text("transactionId");

        let missing: Vec<&str> = [
            ("reference", reference.is_none()),
            ("amount", amount.is_none()),
            ("paymentDate", payment_date.is_none()),
            ("transactionId", transaction_id.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();
        if !missing.is_empty() {
            return Err(PaymentError::InvalidPayload(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let (Some(reference), Some(amount), Some(payment_date), Some(transaction_id)) =
            (reference, amount, payment_date, transaction_id)
        else {
            return Err(PaymentError::InvalidPayload("Missing required fields".to_string()));
        };

        let amount = Amount::parse(&amount)
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
        let payment_date = parse_payment_date(&payment_date)?;

        Ok(Self {
            reference,
            amount,
            payment_date,
            transaction_id,
            bank_name: text("bankName"),
            account_from: text("accountFrom"),
        })
    }

    pub fn attempt(&self) -> ReconciliationAttempt {
        ReconciliationAttempt {
            reference: self.reference.clone(),
            observed_amount: self.amount,
            observed_date: self.payment_date,
            external_transaction_id: Some(self.transaction_id.clone()),
        }
    }
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_payment_date(text: &str) -> Result<DateTime<Utc>, PaymentError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| PaymentError::InvalidPayload(format!("Invalid paymentDate '{}'", text)))
}
