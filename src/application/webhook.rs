use super::audit::Auditor;
use super::bounded;
use super::reconciliation::ReconciliationEngine;
use crate::config::{DEFAULT_STORE_TIMEOUT_MS, DEFAULT_WEBHOOK_CLAIM_LEASE_SECS};
use crate::domain::actor::Actor;
use crate::domain::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::domain::clock::ClockRef;
use crate::domain::ports::{AuditTrailRef, Claim, WebhookLedgerRef};
use crate::domain::reconciliation::{ReconcileOptions, ReconciliationResult};
use crate::domain::webhook::{IngestResult, WebhookCode, WebhookCredential, WebhookPayload};
use crate::error::{PaymentError, Result};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Checks webhook credentials against the configured shared secret and API
/// keys. With nothing configured every delivery is rejected.
#[derive(Clone, Default)]
pub struct CredentialVerifier {
    secret: Option<String>,
    api_keys: Vec<String>,
}

impl CredentialVerifier {
    pub fn new(secret: Option<String>, api_keys: Vec<String>) -> Self {
        Self { secret, api_keys }
    }

    pub fn verify(&self, body: &[u8], credential: Option<&WebhookCredential>) -> Result<()> {
        match credential {
            None => Err(PaymentError::Unauthorized("Missing credential".to_string())),
            Some(WebhookCredential::Signature(header)) => {
                let secret = self.secret.as_deref().ok_or_else(|| {
                    PaymentError::Unauthorized("Signatures are not accepted".to_string())
                })?;
                if verify_signature(secret, body, header) {
                    Ok(())
                } else {
                    Err(PaymentError::Unauthorized("Invalid signature".to_string()))
                }
            }
            Some(WebhookCredential::ApiKey(key)) => {
                let matched = self
                    .api_keys
                    .iter()
                    .any(|known| bool::from(known.as_bytes().ct_eq(key.as_bytes())));
                if matched {
                    Ok(())
                } else {
                    Err(PaymentError::Unauthorized("Invalid API key".to_string()))
                }
            }
        }
    }
}

/// Verifies a `sha256=<hex>` HMAC-SHA256 signature of `body`.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Produces the `sha256=<hex>` header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::ConfigError(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Maps a reconciliation outcome to the code the bank sees.
pub fn ingest_result_for(outcome: &Result<ReconciliationResult>) -> IngestResult {
    match outcome {
        Ok(result) => {
            let code = if result.already_settled {
                WebhookCode::AlreadyPaid
            } else if result.requires_manual_review {
                WebhookCode::ReconciliationError
            } else {
                WebhookCode::PaymentProcessed
            };
            let mut ingest = IngestResult::new(code);
            ingest.payment_id = result.payment_id;
            ingest.requires_manual_review = result.requires_manual_review;
            if result.requires_manual_review {
                ingest.message = Some("Payment held for manual review".to_string());
            }
            ingest
        }
        Err(PaymentError::AuditWriteFailed { outcome, .. }) => {
            ingest_result_for(&Ok(outcome.as_ref().clone()))
        }
        Err(e) => IngestResult::new(code_for_error(e)).with_message(e.to_string()),
    }
}

fn code_for_error(error: &PaymentError) -> WebhookCode {
    match error {
        PaymentError::ReferenceNotFound(_) => WebhookCode::ReferenceNotFound,
        PaymentError::ReferenceExpired(_) => WebhookCode::ReferenceExpired,
        PaymentError::Unauthorized(_) => WebhookCode::Unauthorized,
        PaymentError::InvalidPayload(_) | PaymentError::ValidationError(_) => {
            WebhookCode::InvalidPayload
        }
        PaymentError::TransactionAlreadyApplied(_) => WebhookCode::ReconciliationError,
        _ => WebhookCode::InternalError,
    }
}

/// Accepts bank confirmations and forwards each transaction id to the
/// reconciliation engine at most once.
pub struct WebhookIngestor {
    engine: Arc<ReconciliationEngine>,
    ledger: WebhookLedgerRef,
    auditor: Auditor,
    clock: ClockRef,
    verifier: CredentialVerifier,
    timeout: Duration,
    claim_lease: chrono::Duration,
}

impl WebhookIngestor {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        ledger: WebhookLedgerRef,
        audit: AuditTrailRef,
        clock: ClockRef,
        verifier: CredentialVerifier,
    ) -> Self {
        let timeout = Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS);
        Self {
            engine,
            ledger,
            auditor: Auditor::new(audit, timeout),
            clock,
            verifier,
            timeout,
            claim_lease: chrono::Duration::seconds(DEFAULT_WEBHOOK_CLAIM_LEASE_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.auditor = self.auditor.with_timeout(timeout);
        self
    }

    /// How long a claim may stay unfinished before another delivery of the
    /// same transaction id takes it over.
    pub fn with_claim_lease(mut self, lease: chrono::Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Never fails: every delivery gets a structured answer.
    pub async fn ingest(&self, raw: &[u8], credential: Option<&WebhookCredential>) -> IngestResult {
        let (result, subject) = self.process(raw, credential).await;
        self.audit_delivery(raw, &subject, &result).await;
        result
    }

    async fn process(
        &self,
        raw: &[u8],
        credential: Option<&WebhookCredential>,
    ) -> (IngestResult, String) {
        if let Err(e) = self.verifier.verify(raw, credential) {
            tracing::warn!(error = %e, "Webhook rejected");
            return (
                IngestResult::new(WebhookCode::Unauthorized).with_message(e.to_string()),
                "webhook".to_string(),
            );
        }

        let payload = match WebhookPayload::parse(raw) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Webhook payload rejected");
                return (
                    IngestResult::new(WebhookCode::InvalidPayload).with_message(e.to_string()),
                    "webhook".to_string(),
                );
            }
        };
        let transaction_id = payload.transaction_id.clone();

        let claim = bounded(
            self.timeout,
            "webhook ledger claim",
            self.ledger.claim(&transaction_id, self.clock.now(), self.claim_lease),
        )
        .await;
        match claim {
            Ok(Claim::Claimed) => {}
            Ok(Claim::Completed(prior)) => {
                tracing::info!(%transaction_id, code = ?prior.code, "Duplicate webhook delivery");
                return (prior.replayed(), transaction_id);
            }
            Ok(Claim::InFlight) => {
                tracing::warn!(%transaction_id, "Webhook delivery already in flight");
                return (
                    IngestResult::new(WebhookCode::InternalError)
                        .with_message("Transaction is being processed, retry later"),
                    transaction_id,
                );
            }
            Err(e) => {
                tracing::warn!(%transaction_id, error = %e, "Webhook ledger unavailable");
                return (
                    IngestResult::new(WebhookCode::InternalError).with_message(e.to_string()),
                    transaction_id,
                );
            }
        }

        let options = ReconcileOptions {
            accept_late: self.engine.accepts_late(),
            human_confirmed: false,
        };
        let outcome = self
            .engine
            .reconcile(payload.attempt(), &Actor::System, options)
            .await;
        if let Err(PaymentError::AuditWriteFailed { source, .. }) = &outcome {
            tracing::error!(%transaction_id, error = %source, "Webhook settled without an audit record");
        }
        let result = ingest_result_for(&outcome);

        self.settle_claim(&transaction_id, &result).await;
        (result, transaction_id)
    }

    /// Completes the claim with a definitive result, otherwise releases it.
    /// A completion that cannot be written falls back to a release, so the
    /// next delivery re-runs reconciliation instead of waiting out the lease.
    async fn settle_claim(&self, transaction_id: &str, result: &IngestResult) {
        if result.is_definitive() {
            let completed = bounded(
                self.timeout,
                "webhook ledger complete",
                self.ledger.complete(transaction_id, result.clone()),
            )
            .await;
            match completed {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(%transaction_id, error = %e, "Failed to record webhook outcome in ledger");
                }
            }
        }
        let released = bounded(
            self.timeout,
            "webhook ledger release",
            self.ledger.release(transaction_id),
        )
        .await;
        if let Err(e) = released {
            tracing::error!(
                %transaction_id,
                error = %e,
                "Webhook claim left in flight until its lease lapses"
            );
        }
    }

    async fn audit_delivery(&self, raw: &[u8], subject: &str, result: &IngestResult) {
        let outcome = if result.success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let record = AuditRecord::new(
            AuditAction::WebhookIngest,
            &Actor::System,
            self.clock.now(),
            subject,
            outcome,
        )
        .with_details(json!({
            "rawPayload": String::from_utf8_lossy(raw),
            "code": result.code,
            "duplicate": result.duplicate,
            "paymentId": result.payment_id,
            "message": result.message,
        }));
        // The bank still gets its answer when the audit write fails.
        if let Err(error) = self.auditor.record(record).await {
            tracing::error!(%subject, code = ?result.code, %error, "Webhook delivery answered without an audit record");
        }
    }
}
