//! Retry state machine for transient establishment failures.
//!
//! Fetching a peer's memory attributes and connecting a queue pair both
//! race against the peer's own startup; both are driven by a fixed-interval
//! retry loop. The default policy retries forever, matching the assumption
//! that every configured peer eventually comes up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Interval between connection attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Cancellation signal shared between a blocked establishment loop and
/// another thread that wants to abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Check whether cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Retry policy for a transient operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep interval between attempts.
    pub interval: Duration,
    /// Maximum number of attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: CONNECT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Create a bounded policy.
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Drive `op` until it succeeds, the attempt budget runs out, or the
    /// token is cancelled. Every error from `op` is treated as transient.
    pub fn run<T, F>(&self, cancel: Option<&CancelToken>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempts = 0u32;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }
            match op() {
                Ok(v) => return Ok(v),
                Err(_) => {
                    attempts = attempts.saturating_add(1);
                    if let Some(max) = self.max_attempts {
                        if attempts >= max {
                            return Err(Error::RetriesExhausted(attempts));
                        }
                    }
                    std::thread::sleep(self.interval);
                }
            }
        }
    }
}
