use std::{num::NonZeroUsize, time::Duration};

use thiserror::Error;

use crate::conversions::rho_term::Payload;

pub mod clock;
pub mod queue;

#[derive(Debug, Error)]
pub enum BatchConfigError {
    #[error("max batch size must be positive")]
    ZeroBatchSize,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    max_batch_size: NonZeroUsize,
    quiesce_interval: Duration,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize, quiesce_interval: Duration) -> Result<BatchConfig, BatchConfigError> {
        let max_batch_size =
            NonZeroUsize::new(max_batch_size).ok_or(BatchConfigError::ZeroBatchSize)?;
        Ok(BatchConfig {
            max_batch_size,
            quiesce_interval,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.get()
    }

    /// Inactivity window after the last push before a partial batch is
    /// flushed.
    pub fn quiesce_interval(&self) -> Duration {
        self.quiesce_interval
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN),
            quiesce_interval: Duration::from_secs(4),
        }
    }
}

/// Payloads flushed together, in arrival order. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    sequence: u64,
    payloads: Vec<Payload>,
}

impl Batch {
    pub fn new(sequence: u64, payloads: Vec<Payload>) -> Option<Batch> {
        if payloads.is_empty() {
            return None;
        }
        Some(Batch { sequence, payloads })
    }

    /// Position of this batch in flush order, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Concatenates the payloads into one transaction body.
    pub fn join(&self, separator: &str) -> String {
        let parts: Vec<&str> = self.payloads.iter().map(|p| p.as_str()).collect();
        parts.join(separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            BatchConfig::new(0, Duration::from_secs(1)),
            Err(BatchConfigError::ZeroBatchSize)
        ));
    }

    #[test]
    fn default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size(), 64);
        assert_eq!(config.quiesce_interval(), Duration::from_secs(4));
    }

    #[test]
    fn empty_batch_cannot_be_built() {
        assert!(Batch::new(1, vec![]).is_none());
    }

    #[test]
    fn join_keeps_arrival_order() {
        let batch = Batch::new(
            3,
            vec![Payload::new("a"), Payload::new("b"), Payload::new("c")],
        )
        .unwrap();
        assert_eq!(batch.join("\n|\n"), "a\n|\nb\n|\nc");
        assert_eq!(batch.sequence(), 3);
    }
}
