#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use spei_settlement::application::receipts::{ChannelEventSink, ReceiptTrigger};
use spei_settlement::application::service::{Ports, SettlementService};
use spei_settlement::application::webhook::sign;
use spei_settlement::config::Settings;
use spei_settlement::domain::actor::{Actor, Role};
use spei_settlement::domain::clock::ManualClock;
use spei_settlement::domain::settlement::PaymentSettled;
use spei_settlement::domain::webhook::WebhookCredential;
use spei_settlement::infrastructure::in_memory::{
    InMemoryAuditTrail, InMemoryBilling, InMemoryPendingPaymentStore, InMemoryWebhookLedger,
    RecordingNotifier, RecordingReceiptRenderer,
};
use spei_settlement::interfaces::api::{GenerateReferenceRequest, GenerateReferenceResponse};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const BANK_API_KEY: &str = "bank-key-1";

/// A settlement service wired to in-memory adapters and a manual clock,
/// with handles to every adapter for assertions.
pub struct Harness {
    pub service: SettlementService,
    pub store: InMemoryPendingPaymentStore,
    pub ledger: InMemoryWebhookLedger,
    pub audit: InMemoryAuditTrail,
    pub billing: InMemoryBilling,
    pub clock: ManualClock,
    pub events: mpsc::UnboundedReceiver<PaymentSettled>,
}

pub fn settings() -> Settings {
    Settings {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        webhook_api_keys: vec![BANK_API_KEY.to_string()],
        ..Settings::default()
    }
}

pub fn finance() -> Actor {
    Actor::staff("finance-1", Role::Finance)
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = InMemoryPendingPaymentStore::new();
        let ledger = InMemoryWebhookLedger::new();
        let audit = InMemoryAuditTrail::new();
        let billing = InMemoryBilling::accept_all();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let (sink, events) = ChannelEventSink::channel();

        let ports = Ports {
            store: Arc::new(store.clone()),
            ledger: Arc::new(ledger.clone()),
            audit: Arc::new(audit.clone()),
            billing: Arc::new(billing.clone()),
            events: Arc::new(sink),
            clock: Arc::new(clock.clone()),
        };
        Self {
            service: SettlementService::new(ports, settings),
            store,
            ledger,
            audit,
            billing,
            clock,
            events,
        }
    }

    pub async fn issue(&self, amount: Decimal) -> GenerateReferenceResponse {
        self.service
            .generate_reference(
                GenerateReferenceRequest {
                    student_id: "student-7".to_string(),
                    concept_id: "tuition-2026-03".to_string(),
                    amount,
                    debt_id: None,
                },
                &finance(),
            )
            .await
            .unwrap()
    }

    /// Settlement events published so far.
    pub fn take_events(&mut self) -> Vec<PaymentSettled> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn receipt_trigger(&self) -> (ReceiptTrigger, RecordingReceiptRenderer, RecordingNotifier) {
        let renderer = RecordingReceiptRenderer::new();
        let notifier = RecordingNotifier::new();
        let trigger = ReceiptTrigger::new(
            Arc::new(self.store.clone()),
            Arc::new(renderer.clone()),
            Arc::new(notifier.clone()),
        );
        (trigger, renderer, notifier)
    }
}

pub fn webhook_body(reference: &str, amount: &str, transaction_id: &str) -> Vec<u8> {
    serde_json::json!({
        "reference": reference,
        "amount": amount,
        "paymentDate": "2026-03-01T10:15:00Z",
        "transactionId": transaction_id,
        "bankName": "BBVA",
    })
    .to_string()
    .into_bytes()
}

pub fn signed(body: &[u8]) -> WebhookCredential {
    WebhookCredential::Signature(sign(WEBHOOK_SECRET, body).unwrap())
}
