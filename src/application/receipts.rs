use crate::domain::ports::{EventSink, NotifierRef, PendingPaymentStoreRef, ReceiptRendererRef};
use crate::domain::settlement::PaymentSettled;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Publishes settlement events into an unbounded channel drained by a
/// `ReceiptTrigger`.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<PaymentSettled>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PaymentSettled>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: PaymentSettled) -> Result<()> {
        self.tx.send(event).map_err(|e| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "Settlement channel closed, dropped event for payment {}",
                e.0.payment_id
            ))))
        })
    }
}

/// Turns each `PaymentSettled` into a rendered receipt and a notification.
pub struct ReceiptTrigger {
    store: PendingPaymentStoreRef,
    renderer: ReceiptRendererRef,
    notifier: NotifierRef,
}

impl ReceiptTrigger {
    pub fn new(
        store: PendingPaymentStoreRef,
        renderer: ReceiptRendererRef,
        notifier: NotifierRef,
    ) -> Self {
        Self {
            store,
            renderer,
            notifier,
        }
    }

    /// Renders, records and announces the receipt for one settlement.
    pub async fn handle(&self, event: &PaymentSettled) -> Result<String> {
        let receipt_url = self.renderer.render(event).await?;
        self.store
            .attach_receipt(event.payment_id, &receipt_url)
            .await?;
        self.notifier.payment_settled(event, &receipt_url).await?;
        tracing::info!(payment_id = %event.payment_id, %receipt_url, "Receipt issued");
        Ok(receipt_url)
    }

    /// Drains `events` until every sender is dropped. Returns how many
    /// receipts were issued.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<PaymentSettled>) -> usize {
        let mut issued = 0;
        while let Some(event) = events.recv().await {
            match self.handle(&event).await {
                Ok(_) => issued += 1,
                Err(e) => {
                    tracing::error!(payment_id = %event.payment_id, error = %e, "Receipt generation failed");
                }
            }
        }
        issued
    }

    /// Handles whatever is already queued without waiting for more.
    pub async fn drain(&self, events: &mut mpsc::UnboundedReceiver<PaymentSettled>) -> usize {
        let mut issued = 0;
        while let Ok(event) = events.try_recv() {
            match self.handle(&event).await {
                Ok(_) => issued += 1,
                Err(e) => {
                    tracing::error!(payment_id = %event.payment_id, error = %e, "Receipt generation failed");
                }
            }
        }
        issued
    }
}
