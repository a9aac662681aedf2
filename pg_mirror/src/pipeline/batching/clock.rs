use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::time::Instant;

/// Time source of the batching queue. Handing it in explicitly keeps the
/// quiescence timer testable.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic time, used for arming the quiescence timer.
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;

    /// Wall clock time, only used for logging.
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock backed by the tokio timer, so it follows `tokio::time::pause`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}
