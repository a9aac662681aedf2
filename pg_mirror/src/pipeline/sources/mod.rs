use async_trait::async_trait;
use futures::Stream;
use postgres::{stream::NotificationStreamError, PostgresSourceError};
use thiserror::Error;

use crate::conversions::change_record::ChangeRecord;

pub mod postgres;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source error: {0}")]
    Postgres(#[from] PostgresSourceError),

    #[error("notification stream error: {0}")]
    NotificationStream(#[from] NotificationStreamError),
}

#[async_trait]
pub trait Source: Send + Sized {
    type Stream: Stream<Item = Result<ChangeRecord, NotificationStreamError>> + Send + Unpin;

    /// Makes sure the database emits change notifications. Must succeed
    /// before [`Source::into_stream`] is called.
    async fn prepare(&mut self) -> Result<(), SourceError>;

    async fn into_stream(self) -> Result<Self::Stream, SourceError>;
}
