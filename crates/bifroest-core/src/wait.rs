//! Cancellation-aware timer waits for retry and backoff loops.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ImpError, ImpResult};

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `Err(Cancelled)` when the token was cancelled before the timer
/// elapsed, including when it was already cancelled on entry.
pub async fn wait(cancel: &CancellationToken, duration: Duration) -> ImpResult<()> {
    if cancel.is_cancelled() {
        return Err(ImpError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ImpError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Exponential backoff between `initial` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Wait for the current delay, then double it up to the maximum.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> ImpResult<()> {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        wait(cancel, delay).await
    }

    /// Start over from the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
