pub mod rnode;
pub mod stdout;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Separator of payloads in a batch body. In rholang `|` composes the
/// deploy terms in parallel.
pub const PARALLEL_SEPARATOR: &str = "\n|\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStep {
    Submit,
    Finalize,
}

impl fmt::Display for DeliveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStep::Submit => f.write_str("submit"),
            DeliveryStep::Finalize => f.write_str("finalize"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{step} rejected with status {status}: {body}")]
    Rejected {
        step: DeliveryStep,
        status: u16,
        body: String,
    },

    #[error("invalid {step} response: {reason}")]
    InvalidResponse { step: DeliveryStep, reason: String },
}

impl DeliveryError {
    /// Transport failures, throttling and server errors may succeed on a
    /// later attempt. Rejections of the request itself will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Http(_) => true,
            DeliveryError::Rejected { status, .. } => *status == 429 || *status >= 500,
            DeliveryError::InvalidResponse { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationResult {
    pub message: String,
}

/// The transaction service a flushed batch is delivered to.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn separator(&self) -> &str {
        PARALLEL_SEPARATOR
    }

    /// Submits one transaction body.
    async fn submit(&self, body: &str) -> Result<SubmissionReceipt, DeliveryError>;

    /// Asks the service to finalize what has been submitted so far.
    async fn finalize(&self) -> Result<FinalizationResult, DeliveryError>;
}
