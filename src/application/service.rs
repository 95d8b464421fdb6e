use super::bounded;
use super::expiration::ExpirationSweeper;
use super::reconciliation::{PaymentLookup, ReconciliationEngine};
use super::reference::{ReferenceGenerator, ReferenceRequest};
use super::webhook::{CredentialVerifier, WebhookIngestor, ingest_result_for};
use crate::config::Settings;
use crate::domain::actor::Actor;
use crate::domain::clock::ClockRef;
use crate::domain::money::Amount;
use crate::domain::ports::{
    AuditTrailRef, BillingGatewayRef, EventSinkRef, PendingPaymentStoreRef, WebhookLedgerRef,
};
use crate::domain::reconciliation::{ReconcileOptions, ReconciliationAttempt};
use crate::domain::webhook::{IngestResult, WebhookCredential};
use crate::error::{PaymentError, Result};
use crate::interfaces::api::{
    ConciliationRequest, ConciliationResponse, ConfirmPaymentRequest, ConfirmPaymentResponse,
    GenerateReferenceRequest, GenerateReferenceResponse, StatusResponse,
};
use std::sync::Arc;
use std::time::Duration;

/// Collaborators the settlement core needs from its host.
#[derive(Clone)]
pub struct Ports {
    pub store: PendingPaymentStoreRef,
    pub ledger: WebhookLedgerRef,
    pub audit: AuditTrailRef,
    pub billing: BillingGatewayRef,
    pub events: EventSinkRef,
    pub clock: ClockRef,
}

/// Entry point for the settlement operations exposed to the web layer.
pub struct SettlementService {
    generator: ReferenceGenerator,
    engine: Arc<ReconciliationEngine>,
    ingestor: WebhookIngestor,
    ports: Ports,
    settings: Settings,
    timeout: Duration,
}

impl SettlementService {
    pub fn new(ports: Ports, settings: Settings) -> Self {
        let timeout = settings.store_timeout();
        let generator = ReferenceGenerator::new(
            ports.store.clone(),
            ports.billing.clone(),
            ports.audit.clone(),
            ports.clock.clone(),
        )
        .with_prefix(settings.reference_prefix.clone())
        .with_validity(settings.reference_validity())
        .with_timeout(timeout);

        let engine = Arc::new(
            ReconciliationEngine::new(
                ports.store.clone(),
                ports.billing.clone(),
                ports.events.clone(),
                ports.audit.clone(),
                ports.clock.clone(),
            )
            .with_timeout(timeout)
            .with_late_acceptance(settings.accept_late_payments),
        );

        let ingestor = WebhookIngestor::new(
            Arc::clone(&engine),
            ports.ledger.clone(),
            ports.audit.clone(),
            ports.clock.clone(),
            CredentialVerifier::new(
                settings.webhook_secret.clone(),
                settings.webhook_api_keys.clone(),
            ),
        )
        .with_timeout(timeout)
        .with_claim_lease(settings.webhook_claim_lease());

        Self {
            generator,
            engine,
            ingestor,
            ports,
            settings,
            timeout,
        }
    }

    pub fn engine(&self) -> Arc<ReconciliationEngine> {
        Arc::clone(&self.engine)
    }

    /// A sweeper sharing this service's store, audit trail and clock.
    pub fn sweeper(&self) -> ExpirationSweeper {
        ExpirationSweeper::new(
            self.ports.store.clone(),
            self.ports.audit.clone(),
            self.ports.clock.clone(),
        )
        .with_timeout(self.timeout)
    }

    pub async fn generate_reference(
        &self,
        request: GenerateReferenceRequest,
        actor: &Actor,
    ) -> Result<GenerateReferenceResponse> {
        let payment = self
            .generator
            .generate(
                ReferenceRequest {
                    student_id: request.student_id,
                    concept_id: request.concept_id,
                    amount: request.amount,
                    debt_id: request.debt_id,
                },
                actor,
            )
            .await?;
        Ok(GenerateReferenceResponse {
            reference: payment.reference,
            pending_payment_id: payment.id,
            expiration_timestamp: payment.expiration_timestamp,
            amount: payment.expected_amount,
        })
    }

    pub async fn confirm_payment(
        &self,
        request: ConfirmPaymentRequest,
        actor: &Actor,
    ) -> Result<ConfirmPaymentResponse> {
        let lookup = PaymentLookup::parse(&request.pending_payment_id);
        let result = match self.engine.confirm_payment(lookup, actor).await {
            Ok(result) => result,
            Err(PaymentError::AuditWriteFailed { outcome, source }) => {
                tracing::error!(reference = %outcome.reference, error = %source, "Confirmation committed without audit record");
                *outcome
            }
            Err(e) => return Err(e),
        };
        let receipt_url = match result.payment_id {
            Some(payment_id) => self.receipt_url(payment_id).await?,
            None => None,
        };
        Ok(ConfirmPaymentResponse {
            success: result.settled(),
            payment_id: result.payment_id,
            receipt_url,
        })
    }

    /// Manual reconciliation of one bank-statement movement.
    pub async fn conciliate(
        &self,
        request: ConciliationRequest,
        actor: &Actor,
    ) -> Result<ConciliationResponse> {
        let attempt = ReconciliationAttempt {
            reference: request.reference.trim().to_string(),
            observed_amount: Amount::new(request.amount)?,
            observed_date: request
                .payment_date
                .unwrap_or_else(|| self.ports.clock.now()),
            external_transaction_id: request.transaction_id,
        };
        let options = ReconcileOptions {
            accept_late: self.settings.accept_late_payments,
            human_confirmed: false,
        };
        let outcome = self.engine.reconcile(attempt, actor, options).await;
        match outcome {
            Err(e @ PaymentError::TransientStore(_)) | Err(e @ PaymentError::Unauthorized(_)) => Err(e),
            outcome => {
                let mapped = ingest_result_for(&outcome);
                Ok(ConciliationResponse {
                    success: mapped.success,
                    code: mapped.code,
                    payment_id: mapped.payment_id,
                    requires_manual_review: mapped.requires_manual_review.then_some(true),
                })
            }
        }
    }

    pub async fn ingest_webhook(
        &self,
        raw: &[u8],
        credential: Option<&WebhookCredential>,
    ) -> IngestResult {
        self.ingestor.ingest(raw, credential).await
    }

    /// Looks a pending payment up by id, falling back to its reference.
    pub async fn status(&self, id: &str) -> Result<StatusResponse> {
        let found = match PaymentLookup::parse(id) {
            PaymentLookup::Id(id) => {
                bounded(self.timeout, "pending payment lookup", self.ports.store.get(id)).await?
            }
            PaymentLookup::Reference(reference) => {
                bounded(
                    self.timeout,
                    "reference lookup",
                    self.ports.store.find_by_reference(&reference),
                )
                .await?
            }
        };
        let row = found.ok_or_else(|| PaymentError::NotFound(format!("Pending payment {}", id)))?;
        let receipt_url = match row.linked_payment_id {
            Some(payment_id) => self.receipt_url(payment_id).await?,
            None => None,
        };
        Ok(StatusResponse {
            reference: row.reference,
            status: row.state,
            expiration_timestamp: row.expiration_timestamp,
            payment_id: row.linked_payment_id,
            receipt_url,
        })
    }

    async fn receipt_url(&self, payment_id: uuid::Uuid) -> Result<Option<String>> {
        let payment = bounded(self.timeout, "payment lookup", self.ports.store.get_payment(payment_id)).await?;
        Ok(payment.and_then(|p| p.receipt_url))
    }
}
