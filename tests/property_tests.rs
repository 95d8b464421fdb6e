mod common;

use common::{Harness, finance};
use rand::Rng;
use rust_decimal::Decimal;
use spei_settlement::domain::pending_payment::PaymentState;
use spei_settlement::domain::webhook::WebhookCode;
use spei_settlement::interfaces::api::ConciliationRequest;

#[tokio::test]
async fn test_only_exact_amounts_settle() {
    let mut rng = rand::thread_rng();
    let mut harness = Harness::new();

    for _ in 0..200 {
        let cents: i64 = rng.gen_range(1..=10_000_000);
        let expected = Decimal::new(cents, 2);
        let issued = harness.issue(expected).await;

        let exact = rng.gen_bool(0.5);
        let observed = if exact {
            // same value, different scale
            Decimal::new(cents * 10, 3)
        } else {
            let delta: i64 = rng.gen_range(1..=500);
            let shifted = if rng.gen_bool(0.5) || cents <= delta {
                cents + delta
            } else {
                cents - delta
            };
            Decimal::new(shifted, 2)
        };

        let response = harness
            .service
            .conciliate(
                ConciliationRequest {
                    reference: issued.reference.clone(),
                    amount: observed,
                    payment_date: None,
                    transaction_id: None,
                },
                &finance(),
            )
            .await
            .unwrap();
        let status = harness.service.status(&issued.reference).await.unwrap();

        if exact {
            assert_eq!(response.code, WebhookCode::PaymentProcessed);
            assert_eq!(status.status, PaymentState::Paid);
        } else {
            assert_eq!(response.code, WebhookCode::ReconciliationError, "{expected} vs {observed}");
            assert_eq!(response.requires_manual_review, Some(true));
            assert_eq!(status.status, PaymentState::ManualReview);
        }
    }

    let settled = harness.take_events().len();
    assert_eq!(settled, harness.store.settlement_count().await);
}

#[tokio::test]
async fn test_reference_format_is_stable_and_unique() {
    let harness = Harness::new();
    let mut previous = None;
    let mut seen = std::collections::HashSet::new();
    for _ in 0..3000 {
        let reference = harness.issue(Decimal::ONE).await.reference;
        assert!(reference.starts_with("SPEI"));
        assert_eq!(reference.len(), 4 + 10 + 2);
        assert!(reference[4..].chars().all(|c| c.is_ascii_digit()));
        if let Some(prev) = previous.replace(reference.clone()) {
            assert!(reference > prev);
        }
        assert!(seen.insert(reference));
    }
}
