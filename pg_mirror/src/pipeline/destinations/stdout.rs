use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{DeliveryError, DeliverySink, FinalizationResult, SubmissionReceipt};

/// Logs deliveries instead of sending them anywhere.
#[derive(Debug, Default)]
pub struct StdoutDestination {
    submitted: AtomicU64,
}

#[async_trait]
impl DeliverySink for StdoutDestination
where
    Self: Send + Sync,
{
    async fn submit(&self, body: &str) -> Result<SubmissionReceipt, DeliveryError> {
        let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        info!("submitting deploy {n}:\n{body}");
        Ok(SubmissionReceipt {
            id: format!("stdout-{n}"),
            submitted_at: Utc::now(),
        })
    }

    async fn finalize(&self) -> Result<FinalizationResult, DeliveryError> {
        info!("finalizing {} deploys", self.submitted.load(Ordering::SeqCst));
        Ok(FinalizationResult {
            message: "nothing to propose".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receipts_are_numbered() {
        let dest = StdoutDestination::default();

        assert_eq!(dest.submit("a").await.unwrap().id, "stdout-1");
        assert_eq!(dest.submit("b").await.unwrap().id, "stdout-2");
        assert!(dest.finalize().await.is_ok());
    }
}
