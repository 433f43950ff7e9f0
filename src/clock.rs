//! Clock capability: wall time and sleeping behind one seam.
//!
//! DESIGN
//! ======
//! Every timer in the crate (retry backoff, per-call timeouts, periodic
//! validation, the loading watchdog) goes through [`Clock`], so tests can
//! drive the session machinery under paused tokio time and record exactly
//! which sleeps happened.

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;

use crate::backend::BackendError;

#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> OffsetDateTime;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Milliseconds since the Unix epoch for `at`.
#[must_use]
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Race `fut` against `clock.sleep(limit)`.
///
/// The operation is polled first, so an already-complete future always wins.
/// A late result after the deadline is dropped with the future.
pub async fn timed<T, F>(clock: &dyn Clock, limit: Duration, operation: &'static str, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        result = fut => result,
        () = clock.sleep(limit) => Err(BackendError::Timeout {
            operation,
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
