use std::{path::PathBuf, sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, AcquireError, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::{
    batching::Batch,
    destinations::{DeliveryError, DeliverySink},
};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("unable to acquire sempahore")]
    SemaphoreError(#[from] AcquireError),
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Deliveries allowed to overlap. With 1, batches reach the sink strictly
    /// in flush order.
    pub max_in_flight: usize,
    /// Retries per delivery step after the first attempt.
    pub max_retries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Batches that could not be submitted are written here.
    pub dead_letter_dir: Option<PathBuf>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_retries: 5,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            dead_letter_dir: None,
        }
    }
}

impl PublisherConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries)
    }
}

/// Delivers flushed batches to the sink in the background. Delivery failures
/// are retried, then logged or dead-lettered; they never reach the queue.
pub struct Publisher<Dest: DeliverySink> {
    semaphore: Arc<Semaphore>,
    destination: Arc<Dest>,
    task_tracker: TaskTracker,
    config: Arc<PublisherConfig>,
}

impl<Dest: DeliverySink + 'static> Publisher<Dest> {
    pub fn new(destination: Dest, config: PublisherConfig) -> Self {
        Publisher {
            semaphore: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            destination: Arc::new(destination),
            task_tracker: TaskTracker::new(),
            config: Arc::new(config),
        }
    }

    /// Publishes batches in the order they are received until the sending
    /// side is dropped.
    pub async fn run(&self, mut batches: mpsc::UnboundedReceiver<Batch>) -> Result<(), PublisherError> {
        while let Some(batch) = batches.recv().await {
            self.publish(batch).await?;
        }
        Ok(())
    }

    /// Waits for a delivery slot, then delivers `batch` without waiting for
    /// the outcome.
    pub async fn publish(&self, batch: Batch) -> Result<(), PublisherError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let d = self.destination.clone();
        let config = self.config.clone();

        self.task_tracker.spawn(async move {
            deliver(d.as_ref(), &config, batch).await;
            drop(permit);
        });

        Ok(())
    }

    /// Waits for all in-flight deliveries.
    pub async fn stop(&self) {
        self.semaphore.close();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}

async fn deliver<Dest: DeliverySink>(destination: &Dest, config: &PublisherConfig, batch: Batch) {
    let body = batch.join(destination.separator());
    let sequence = batch.sequence();

    let receipt = (|| destination.submit(&body))
        .retry(config.backoff())
        .when(DeliveryError::is_retryable)
        .notify(|e: &DeliveryError, dur: Duration| {
            warn!("submit of batch {sequence} failed, retrying in {dur:?}: {e}");
        })
        .await;

    let receipt = match receipt {
        Ok(receipt) => receipt,
        Err(e) => {
            error!("giving up on batch {sequence} ({} payloads): {e}", batch.len());
            dead_letter(config, &batch, &body).await;
            return;
        }
    };
    info!("batch {sequence} submitted as {}", receipt.id);

    let finalized = (|| destination.finalize())
        .retry(config.backoff())
        .when(DeliveryError::is_retryable)
        .notify(|e: &DeliveryError, dur: Duration| {
            warn!("finalize after batch {sequence} failed, retrying in {dur:?}: {e}");
        })
        .await;

    match finalized {
        Ok(result) => info!("batch {sequence} finalized: {}", result.message),
        // The deploy has been accepted; a later finalize will include it.
        Err(e) => error!("finalize after batch {sequence} failed: {e}"),
    }
}

async fn dead_letter(config: &PublisherConfig, batch: &Batch, body: &str) {
    let Some(ref dir) = config.dead_letter_dir else {
        return;
    };

    let path = dir.join(format!(
        "{}-{:06}.rho",
        Utc::now().format("%Y%m%dT%H%M%S"),
        batch.sequence()
    ));
    let written = match tokio::fs::create_dir_all(dir).await {
        Ok(()) => tokio::fs::write(&path, body).await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => warn!("batch {} written to {}", batch.sequence(), path.display()),
        Err(e) => error!(
            "unable to write batch {} to {}: {e}",
            batch.sequence(),
            path.display()
        ),
    }
}
