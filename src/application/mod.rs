//! Application layer containing the settlement use cases.
//!
//! Each use case owns its collaborators as `Arc<dyn Port>` handles and bounds
//! every call to them with a timeout, so a stalled backend surfaces as a
//! `TransientStore` error rather than a hang or a business outcome.

pub mod audit;
pub mod expiration;
pub mod receipts;
pub mod reconciliation;
pub mod reference;
pub mod service;
pub mod webhook;

use crate::error::{PaymentError, Result};
use std::future::Future;
use std::time::Duration;

/// Runs `fut` with an upper bound of `limit`. Elapsed time becomes a
/// transient error naming the operation.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PaymentError::TransientStore(format!(
            "{} timed out after {:?}",
            operation, limit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(PaymentError::TransientStore(msg)) => assert!(msg.contains("slow call")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), "fast", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
