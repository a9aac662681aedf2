use std::{future::pending, mem};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info};

use crate::conversions::rho_term::Payload;

use super::{clock::Clock, Batch, BatchConfig};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batching queue has been finished")]
    Finished,
}

enum QueueMessage {
    Push { payload: Payload },
    Finish { respond_to: oneshot::Sender<()> },
}

/// Owned exclusively by the queue actor.
struct QueueState {
    buffer: Vec<Payload>,
    /// Deadline of the armed quiescence timer. Replacing it cancels the
    /// previous one, so at most one timer is pending.
    quiesce_deadline: Option<Instant>,
    last_activity: Option<Instant>,
}

impl QueueState {
    fn new(capacity: usize) -> QueueState {
        QueueState {
            buffer: Vec::with_capacity(capacity),
            quiesce_deadline: None,
            last_activity: None,
        }
    }
}

/// Accumulates payloads and flushes them as a [`Batch`] when the buffer
/// reaches the maximum batch size or when no push arrived for the
/// quiescence interval. Flushed batches are handed to `batches` without
/// waiting for their delivery.
struct BatchingQueue<C: Clock> {
    receiver: mpsc::Receiver<QueueMessage>,
    state: QueueState,
    config: BatchConfig,
    clock: C,
    batches: mpsc::UnboundedSender<Batch>,
    next_sequence: u64,
}

impl<C: Clock> BatchingQueue<C> {
    fn new(
        receiver: mpsc::Receiver<QueueMessage>,
        config: BatchConfig,
        clock: C,
        batches: mpsc::UnboundedSender<Batch>,
    ) -> Self {
        Self {
            receiver,
            state: QueueState::new(config.max_batch_size()),
            config,
            clock,
            batches,
            next_sequence: 1,
        }
    }

    async fn run(&mut self) {
        loop {
            let quiesce_deadline = self.state.quiesce_deadline;
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(QueueMessage::Push { payload }) => self.push(payload),
                    Some(QueueMessage::Finish { respond_to }) => {
                        self.finish(respond_to).await;
                        break;
                    }
                    None => {
                        info!("all queue handles dropped, flushing");
                        self.flush();
                        break;
                    }
                },
                _ = wait_until(&self.clock, quiesce_deadline) => self.quiesced(),
            }
        }
    }

    fn push(&mut self, payload: Payload) {
        let now = self.clock.now();
        self.state.buffer.push(payload);
        self.state.last_activity = Some(now);

        let qty = self.state.buffer.len();
        let max_qty = self.config.max_batch_size();
        if qty >= max_qty {
            info!("batch full at {} (qty: {qty}, max_qty: {max_qty})", self.clock.utc_now());
            self.flush();
        } else {
            self.state.quiesce_deadline = Some(now + self.config.quiesce_interval());
        }
    }

    fn quiesced(&mut self) {
        let quiesce_time = self.config.quiesce_interval();
        let delta = self
            .state
            .last_activity
            .map(|last| self.clock.now().saturating_duration_since(last))
            .unwrap_or_default();
        info!(
            "quiesced at {} (quiesce_time: {quiesce_time:?}, idle for: {delta:?}, qty: {})",
            self.clock.utc_now(),
            self.state.buffer.len()
        );
        self.flush();
    }

    /// Stops accepting pushes, keeps the ones already queued, flushes and
    /// then acknowledges every pending finish call.
    async fn finish(&mut self, respond_to: oneshot::Sender<()>) {
        self.receiver.close();
        let mut waiters = vec![respond_to];
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                QueueMessage::Push { payload } => self.push(payload),
                QueueMessage::Finish { respond_to } => waiters.push(respond_to),
            }
        }
        self.flush();
        info!("batching queue finished");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn flush(&mut self) {
        self.state.quiesce_deadline = None;

        let payloads = mem::replace(
            &mut self.state.buffer,
            Vec::with_capacity(self.config.max_batch_size()),
        );
        let Some(batch) = Batch::new(self.next_sequence, payloads) else {
            return;
        };
        self.next_sequence += 1;

        debug!("flushing batch {} with {} payloads", batch.sequence(), batch.len());
        if let Err(e) = self.batches.send(batch) {
            error!(
                "publisher is gone, dropping batch {} with {} payloads",
                e.0.sequence(),
                e.0.len()
            );
        }
    }
}

async fn wait_until<C: Clock>(clock: &C, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Public face of the batching queue. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueMessage>,
}

impl QueueHandle {
    /// Spawns the queue actor. Flushed batches are sent to `batches` in flush
    /// order.
    pub fn new<C: Clock>(
        config: BatchConfig,
        clock: C,
        batches: mpsc::UnboundedSender<Batch>,
    ) -> QueueHandle {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let mut actor = BatchingQueue::new(receiver, config, clock, batches);

        tokio::spawn(async move {
            actor.run().await;
        });

        QueueHandle { sender }
    }

    /// Fails with [`QueueError::Finished`] once [`QueueHandle::finish`] has
    /// been called.
    pub async fn push(&self, payload: Payload) -> Result<(), QueueError> {
        self.sender
            .send(QueueMessage::Push { payload })
            .await
            .map_err(|_| QueueError::Finished)
    }

    /// Flushes whatever is buffered, cancels the quiescence timer and seals
    /// the queue. Does not wait for deliveries. Calling it again is a no-op.
    pub async fn finish(&self) {
        let (send, recv) = oneshot::channel();
        let msg = QueueMessage::Finish { respond_to: send };

        if self.sender.send(msg).await.is_err() {
            return;
        }
        let _ = recv.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{advance, sleep};

    use super::*;
    use crate::pipeline::batching::clock::TokioClock;

    const QUIESCE: Duration = Duration::from_secs(4);

    fn payloads(batch: &Batch) -> Vec<&str> {
        batch.payloads().iter().map(|p| p.as_str()).collect()
    }

    fn queue(max_batch_size: usize) -> (QueueHandle, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = BatchConfig::new(max_batch_size, QUIESCE).unwrap();
        (QueueHandle::new(config, TokioClock, tx), rx)
    }

    async fn push_all(handle: &QueueHandle, items: &[&str]) {
        for item in items {
            handle.push(Payload::new(*item)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_then_quiescence() {
        let (handle, mut batches) = queue(3);
        let start = Instant::now();

        push_all(&handle, &["1", "2", "3", "4", "5"]).await;

        let first = batches.recv().await.unwrap();
        assert_eq!(payloads(&first), vec!["1", "2", "3"]);
        assert_eq!(first.sequence(), 1);
        assert!(start.elapsed() < QUIESCE);

        let second = batches.recv().await.unwrap();
        assert_eq!(payloads(&second), vec!["4", "5"]);
        assert_eq!(second.sequence(), 2);
        assert!(start.elapsed() >= QUIESCE);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_flushes_before_timer() {
        let (handle, mut batches) = queue(64);

        push_all(&handle, &["1"]).await;
        handle.finish().await;

        let batch = batches.try_recv().unwrap();
        assert_eq!(payloads(&batch), vec!["1"]);

        advance(QUIESCE * 2).await;
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn every_push_resets_quiescence() {
        let (handle, mut batches) = queue(64);
        let start = Instant::now();

        for item in ["a", "b", "c", "d"] {
            handle.push(Payload::new(item)).await.unwrap();
            sleep(QUIESCE / 2).await;
            assert!(batches.try_recv().is_err());
        }

        let batch = batches.recv().await.unwrap();
        assert_eq!(payloads(&batch), vec!["a", "b", "c", "d"]);
        // Last push happened at 3 * QUIESCE / 2.
        assert!(start.elapsed() >= QUIESCE * 3 / 2 + QUIESCE);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_twice_on_empty_queue_is_a_noop() {
        let (handle, mut batches) = queue(4);

        handle.finish().await;
        handle.finish().await;

        assert!(batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn push_after_finish_is_rejected() {
        let (handle, mut batches) = queue(4);

        push_all(&handle, &["1", "2"]).await;
        handle.finish().await;

        assert!(matches!(
            handle.push(Payload::new("3")).await,
            Err(QueueError::Finished)
        ));
        assert_eq!(payloads(&batches.recv().await.unwrap()), vec!["1", "2"]);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_payload_lost_or_duplicated() {
        let (handle, mut batches) = queue(7);
        let items: Vec<String> = (0..100).map(|i| i.to_string()).collect();

        for (i, item) in items.iter().enumerate() {
            handle.push(Payload::new(item.clone())).await.unwrap();
            if i % 13 == 0 {
                sleep(QUIESCE + Duration::from_millis(1)).await;
            }
        }
        handle.finish().await;

        let mut flushed = vec![];
        let mut sequences = vec![];
        while let Some(batch) = batches.recv().await {
            assert!(batch.len() <= 7);
            sequences.push(batch.sequence());
            flushed.extend(batch.payloads().iter().map(|p| p.as_str().to_string()));
        }

        assert_eq!(flushed, items);
        let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_all_handles_flushes() {
        let (handle, mut batches) = queue(64);

        push_all(&handle, &["x"]).await;
        drop(handle);

        assert_eq!(payloads(&batches.recv().await.unwrap()), vec!["x"]);
        assert!(batches.recv().await.is_none());
    }
}
