use batching::queue::QueueError;
use publisher::PublisherError;
use sources::SourceError;
use thiserror::Error;

pub mod batching;
pub mod data_pipeline;
pub mod destinations;
pub mod publisher;
pub mod sources;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    SourceError(#[from] SourceError),

    #[error("queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("publisher error: {0}")]
    PublisherError(#[from] PublisherError),

    #[error("publisher task failed: {0}")]
    PublisherTask(#[from] tokio::task::JoinError),
}
