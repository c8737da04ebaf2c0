//! One-shot polling until a predicate completes

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Result of one predicate evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Condition met, stop polling
    Done(T),
    /// Not there yet, poll again
    Pending,
}

/// Why [`Until::run`] gave up
#[derive(Debug, thiserror::Error)]
pub enum UntilError<E> {
    /// The deadline passed before the predicate completed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The predicate returned an error
    #[error(transparent)]
    Failed(E),
}

/// Polls a predicate until it reports completion or a timeout elapses
///
/// Errors returned by the predicate abort polling immediately. A predicate
/// that considers an error retryable should map it to [`Check::Pending`].
#[derive(Debug, Clone)]
pub struct Until {
    timeout: Duration,
    interval: Duration,
    reset_timer: bool,
}

impl Until {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_INTERVAL,
            reset_timer: false,
        }
    }

    /// Delay between evaluations
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Re-arm the deadline after every evaluation
    ///
    /// For long multi-phase waits the timeout then bounds a single phase
    /// that makes no progress rather than the whole wait.
    pub fn reset_timer_every_loop(mut self) -> Self {
        self.reset_timer = true;
        self
    }

    pub async fn run<T, E, F, Fut>(&self, mut check: F) -> Result<T, UntilError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Check<T>, E>>,
    {
        let mut deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::time::timeout(remaining, check())
                .await
                .map_err(|_| UntilError::Timeout(self.timeout))?;

            match outcome.map_err(UntilError::Failed)? {
                Check::Done(value) => return Ok(value),
                Check::Pending => {}
            }

            if self.reset_timer {
                deadline = Instant::now() + self.timeout;
            }
            if Instant::now() + self.interval >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(UntilError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
