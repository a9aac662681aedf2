use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{ready, Stream};
use pin_project_lite::pin_project;
use thiserror::Error;

use crate::{
    clients::postgres::NotifyClientError,
    conversions::change_record::{ChangeRecord, ChangeRecordConversionError},
};

#[derive(Debug, Error)]
pub enum NotificationStreamError {
    #[error("notify client error: {0}")]
    NotifyClient(#[from] NotifyClientError),

    #[error("malformed notification {payload}: {source}")]
    MalformedNotification {
        payload: String,
        source: ChangeRecordConversionError,
    },
}

impl NotificationStreamError {
    /// A malformed message only affects itself; anything else ends the stream.
    pub fn is_malformed(&self) -> bool {
        matches!(self, NotificationStreamError::MalformedNotification { .. })
    }
}

pin_project! {
    /// Decodes raw channel payloads into change records, one item per
    /// notification and in channel order. No buffering happens here.
    #[must_use = "streams do nothing unless polled"]
    pub struct NotificationStream<S> {
        #[pin]
        stream: S,
    }
}

impl<S> NotificationStream<S>
where
    S: Stream<Item = Result<String, NotifyClientError>>,
{
    pub fn new(stream: S) -> NotificationStream<S> {
        NotificationStream { stream }
    }
}

impl<S> Stream for NotificationStream<S>
where
    S: Stream<Item = Result<String, NotifyClientError>>,
{
    type Item = Result<ChangeRecord, NotificationStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.stream.poll_next(cx)) {
            Some(Ok(payload)) => match payload.parse::<ChangeRecord>() {
                Ok(record) => Poll::Ready(Some(Ok(record))),
                Err(source) => Poll::Ready(Some(Err(
                    NotificationStreamError::MalformedNotification { payload, source },
                ))),
            },
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => Poll::Ready(None),
        }
    }
}
