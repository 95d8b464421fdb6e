use super::audit::Auditor;
use super::bounded;
use crate::config::{DEFAULT_REFERENCE_PREFIX, DEFAULT_REFERENCE_VALIDITY_HOURS, DEFAULT_STORE_TIMEOUT_MS};
use crate::domain::actor::Actor;
use crate::domain::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::domain::clock::ClockRef;
use crate::domain::money::Amount;
use crate::domain::pending_payment::{PaymentState, PendingPayment};
use crate::domain::ports::{AuditTrailRef, BillingGatewayRef, PendingPaymentStoreRef};
use crate::error::{PaymentError, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde_json::json;

/// Attempts at finding an unused reference before giving up.
const MAX_ISSUE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRequest {
    pub student_id: String,
    pub concept_id: String,
    pub amount: Decimal,
    pub debt_id: Option<String>,
}

/// Issues payment references.
///
/// References are `<prefix><10-digit sequence><2 check digits>`. The sequence
/// comes from the store and is never reused, and the insert itself rejects a
/// reference that was issued before, so uniqueness holds across restarts and
/// concurrent callers.
pub struct ReferenceGenerator {
    store: PendingPaymentStoreRef,
    billing: BillingGatewayRef,
    auditor: Auditor,
    clock: ClockRef,
    prefix: String,
    validity: Duration,
    timeout: std::time::Duration,
}

impl ReferenceGenerator {
    pub fn new(
        store: PendingPaymentStoreRef,
        billing: BillingGatewayRef,
        audit: AuditTrailRef,
        clock: ClockRef,
    ) -> Self {
        let timeout = std::time::Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS);
        Self {
            store,
            billing,
            auditor: Auditor::new(audit, timeout),
            clock,
            prefix: DEFAULT_REFERENCE_PREFIX.to_string(),
            validity: Duration::hours(DEFAULT_REFERENCE_VALIDITY_HOURS),
            timeout,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Overrides how long a new reference stays payable.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self.auditor = self.auditor.with_timeout(timeout);
        self
    }

    pub async fn generate(&self, request: ReferenceRequest, actor: &Actor) -> Result<PendingPayment> {
        let outcome = self.issue(&request).await;
        let now = self.clock.now();

        let record = match &outcome {
            Ok(payment) => AuditRecord::new(
                AuditAction::ReferenceGenerated,
                actor,
                now,
                &payment.reference,
                AuditOutcome::Success,
            )
            .with_states(None, Some(PaymentState::Pending))
            .with_details(json!({
                "pendingPaymentId": payment.id,
                "studentId": payment.student_id,
                "conceptId": payment.concept_id,
                "debtId": payment.debt_id,
                "amount": payment.expected_amount,
                "expirationTimestamp": payment.expiration_timestamp,
            })),
            Err(e) => AuditRecord::new(
                AuditAction::ReferenceGenerated,
                actor,
                now,
                &request.student_id,
                AuditOutcome::Failure,
            )
            .with_details(json!({
                "studentId": request.student_id,
                "conceptId": request.concept_id,
                "debtId": request.debt_id,
                "amount": request.amount.to_string(),
                "error": e.to_string(),
            })),
        };
        let audited = self.auditor.record(record).await;

        let payment = outcome?;
        tracing::info!(
            reference = %payment.reference,
            student_id = %payment.student_id,
            amount = %payment.expected_amount,
            expires = %payment.expiration_timestamp,
            "Reference issued"
        );
        // The reference exists now; an audit failure is reported, not rolled back.
        audited?;
        Ok(payment)
    }

    async fn issue(&self, request: &ReferenceRequest) -> Result<PendingPayment> {
        let amount = Amount::new(request.amount)?;
        if request.student_id.trim().is_empty() || request.concept_id.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "studentId and conceptId are required".to_string(),
            ));
        }

        let concept_known = bounded(
            self.timeout,
            "concept lookup",
            self.billing.concept_exists(&request.concept_id),
        )
        .await?;
        if !concept_known {
            return Err(PaymentError::NotFound(format!(
                "Concept {}",
                request.concept_id
            )));
        }
        if let Some(debt_id) = &request.debt_id {
            let debt_known =
                bounded(self.timeout, "debt lookup", self.billing.debt_exists(debt_id)).await?;
            if !debt_known {
                return Err(PaymentError::NotFound(format!("Debt {}", debt_id)));
            }
        }

        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let sequence =
                bounded(self.timeout, "reference sequence", self.store.next_sequence()).await?;
            let created_at = self.clock.now();
            let expires_at = created_at.checked_add_signed(self.validity).ok_or_else(|| {
                PaymentError::ConfigError(format!(
                    "Reference validity of {} hours overflows the calendar",
                    self.validity.num_hours()
                ))
            })?;
            let payment = PendingPayment::new(
                format_reference(&self.prefix, sequence),
                request.student_id.clone(),
                request.concept_id.clone(),
                request.debt_id.clone(),
                amount,
                created_at,
                expires_at,
            );
            match bounded(self.timeout, "pending payment insert", self.store.insert(payment.clone()))
                .await
            {
                Ok(()) => return Ok(payment),
                Err(PaymentError::Conflict(reason)) => {
                    tracing::warn!(%reason, "Reference collision, drawing a new sequence");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::Conflict(
            "Could not allocate an unused reference".to_string(),
        ))
    }
}

/// Builds `<prefix><sequence:010><check:02>` where the check digits follow
/// ISO 7064 MOD 97-10 over the sequence.
pub fn format_reference(prefix: &str, sequence: u64) -> String {
    format!("{}{:010}{:02}", prefix, sequence, check_digits(sequence))
}

fn check_digits(sequence: u64) -> u64 {
    let shifted = (sequence as u128) * 100;
    (98 - (shifted % 97)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::{Clock, ManualClock};
    use crate::domain::ports::{AuditTrail, PendingPaymentStore};
    use crate::infrastructure::in_memory::{
        InMemoryAuditTrail, InMemoryBilling, InMemoryPendingPaymentStore,
    };
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn request(amount: Decimal) -> ReferenceRequest {
        ReferenceRequest {
            student_id: "student-1".to_string(),
            concept_id: "tuition".to_string(),
            amount,
            debt_id: None,
        }
    }

    fn generator(
        store: InMemoryPendingPaymentStore,
        billing: InMemoryBilling,
        audit: InMemoryAuditTrail,
        clock: ManualClock,
    ) -> ReferenceGenerator {
        ReferenceGenerator::new(
            Arc::new(store),
            Arc::new(billing),
            Arc::new(audit),
            Arc::new(clock),
        )
    }

    #[test]
    fn test_reference_format() {
        let reference = format_reference("SPEI", 1);
        assert_eq!(reference.len(), 4 + 10 + 2);
        assert!(reference.starts_with("SPEI0000000001"));
        // digits followed by their check digits are congruent to 1 mod 97
        let digits: u128 = reference[4..].parse().unwrap();
        assert_eq!(digits % 97, 1);
    }

    #[tokio::test]
    async fn test_generate_sets_expiration_from_validity() {
        let clock = ManualClock::default();
        let store = InMemoryPendingPaymentStore::new();
        let generator = generator(
            store.clone(),
            InMemoryBilling::accept_all(),
            InMemoryAuditTrail::new(),
            clock.clone(),
        )
        .with_validity(Duration::hours(1));

        let payment = generator
            .generate(request(dec!(5000.00)), &Actor::System)
            .await
            .unwrap();
        assert_eq!(payment.state, PaymentState::Pending);
        assert_eq!(payment.expiration_timestamp, clock.now() + Duration::hours(1));
        assert_eq!(
            store.find_by_reference(&payment.reference).await.unwrap(),
            Some(payment)
        );
    }

    #[tokio::test]
    async fn test_default_validity_is_72_hours() {
        let clock = ManualClock::default();
        let generator = generator(
            InMemoryPendingPaymentStore::new(),
            InMemoryBilling::accept_all(),
            InMemoryAuditTrail::new(),
            clock.clone(),
        );
        let payment = generator
            .generate(request(dec!(1)), &Actor::System)
            .await
            .unwrap();
        assert_eq!(
            payment.expiration_timestamp - payment.created_at,
            Duration::hours(72)
        );
    }

    #[tokio::test]
    async fn test_overflowing_validity_is_an_error() {
        let store = InMemoryPendingPaymentStore::new();
        let audit = InMemoryAuditTrail::new();
        let oversized = crate::config::Settings {
            reference_validity_hours: i64::MAX,
            ..Default::default()
        };
        let generator = generator(
            store.clone(),
            InMemoryBilling::accept_all(),
            audit.clone(),
            ManualClock::default(),
        )
        .with_validity(oversized.reference_validity());

        let result = generator.generate(request(dec!(10)), &Actor::System).await;
        assert!(matches!(result, Err(PaymentError::ConfigError(_))));
        assert!(store.all().await.is_empty());
        let records = audit.all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Failure);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount_and_audits() {
        let audit = InMemoryAuditTrail::new();
        let generator = generator(
            InMemoryPendingPaymentStore::new(),
            InMemoryBilling::accept_all(),
            audit.clone(),
            ManualClock::default(),
        );
        for amount in [dec!(0), dec!(-10)] {
            let result = generator.generate(request(amount), &Actor::System).await;
            assert!(matches!(result, Err(PaymentError::ValidationError(_))));
        }
        let records = audit.all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.outcome == AuditOutcome::Failure));
    }

    #[tokio::test]
    async fn test_unknown_concept_or_debt() {
        let billing = InMemoryBilling::new();
        billing.add_concept("tuition").await;
        let generator = generator(
            InMemoryPendingPaymentStore::new(),
            billing,
            InMemoryAuditTrail::new(),
            ManualClock::default(),
        );

        let mut unknown_concept = request(dec!(10));
        unknown_concept.concept_id = "uniform".to_string();
        assert!(matches!(
            generator.generate(unknown_concept, &Actor::System).await,
            Err(PaymentError::NotFound(_))
        ));

        let mut unknown_debt = request(dec!(10));
        unknown_debt.debt_id = Some("D-404".to_string());
        assert!(matches!(
            generator.generate(unknown_debt, &Actor::System).await,
            Err(PaymentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_references_never_repeat() {
        let generator = generator(
            InMemoryPendingPaymentStore::new(),
            InMemoryBilling::accept_all(),
            InMemoryAuditTrail::new(),
            ManualClock::default(),
        );
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let payment = generator
                .generate(request(dec!(1)), &Actor::System)
                .await
                .unwrap();
            assert!(seen.insert(payment.reference));
        }
    }
}
