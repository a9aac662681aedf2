use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    conversions::{change_record::ChangeRecord, rho_term::EventSerializer},
    pipeline::{
        batching::{clock::TokioClock, queue::QueueHandle, BatchConfig},
        sources::{postgres::stream::NotificationStreamError, Source, SourceError},
        PipelineError,
    },
};

use super::{
    destinations::DeliverySink,
    publisher::{Publisher, PublisherConfig},
};

/// Counters of one mirroring session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    pub forwarded: u64,
    pub malformed: u64,
    pub unserializable: u64,
}

pub struct DataPipeline<Src: Source, Ser: EventSerializer, Dest: DeliverySink> {
    source: Src,
    serializer: Ser,
    publisher: Arc<Publisher<Dest>>,
    batch_config: BatchConfig,
    cancel: CancellationToken,
}

impl<Src: Source, Ser: EventSerializer, Dest: DeliverySink + 'static> DataPipeline<Src, Ser, Dest> {
    pub fn new(
        source: Src,
        serializer: Ser,
        destination: Dest,
        batch_config: BatchConfig,
        publisher_config: PublisherConfig,
    ) -> Self {
        DataPipeline {
            source,
            serializer,
            publisher: Arc::new(Publisher::new(destination, publisher_config)),
            batch_config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops listening and shuts the pipeline down
    /// gracefully.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<MirrorStats, PipelineError> {
        let DataPipeline {
            mut source,
            serializer,
            publisher,
            batch_config,
            cancel,
        } = self;

        // Without working triggers there is nothing to listen to.
        source.prepare().await?;
        let changes = source.into_stream().await?;

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let queue = QueueHandle::new(batch_config, TokioClock, batch_tx);
        let publisher_task = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.run(batch_rx).await })
        };

        let res = mirror_events(changes, &serializer, &queue, &cancel).await;
        match res {
            Ok(ref stats) => info!("main loop exited: {stats:?}"),
            Err(ref e) => error!("Main loop exited with {e:?}"),
        }

        queue.finish().await;
        drop(queue);
        info!("finished batching queue");

        publisher_task.await??;
        publisher.stop().await;
        info!("stopped publisher");

        res
    }
}

/// Serializes every change and pushes it to the queue, in stream order.
/// Malformed notifications and records that cannot be serialized are logged
/// and skipped.
pub async fn mirror_events<S, Ser>(
    mut changes: S,
    serializer: &Ser,
    queue: &QueueHandle,
    cancel: &CancellationToken,
) -> Result<MirrorStats, PipelineError>
where
    S: Stream<Item = Result<ChangeRecord, NotificationStreamError>> + Unpin,
    Ser: EventSerializer,
{
    let mut stats = MirrorStats::default();

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => {
                info!("mirroring cancelled");
                break;
            }
            change = changes.next() => change,
        };

        match change {
            Some(Ok(record)) => {
                debug!("{} on {}", record.operation(), record.table());
                match serializer.serialize(&record) {
                    Ok(payload) => {
                        queue.push(payload).await?;
                        stats.forwarded += 1;
                    }
                    Err(e) => {
                        stats.unserializable += 1;
                        warn!(
                            "skipping {} on {}: {e}",
                            record.operation(),
                            record.table()
                        );
                    }
                }
            }
            Some(Err(e)) if e.is_malformed() => {
                stats.malformed += 1;
                warn!("skipping notification: {e}");
            }
            Some(Err(e)) => return Err(SourceError::from(e).into()),
            None => {
                info!("notification stream ended");
                break;
            }
        }
    }

    Ok(stats)
}
