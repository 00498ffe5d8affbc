//! Retry with exponential backoff for transient I/O failures.

use crate::IoPort;
use ffs_error::{FfsError, Result};
use ffs_extent::{Extent, ExtentMap};
use ffs_log::{Logger, Severity};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `f`, retrying transient failures. Non-transient failures pass
    /// through unchanged; exhausting the budget yields `RetryExhausted`.
    pub fn run<T>(
        &self,
        op: &'static str,
        logger: &Logger,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(FfsError::RetryExhausted {
                        op,
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    if logger.enabled(Severity::Warn) {
                        logger.emit(
                            &logger
                                .event(
                                    Severity::Warn,
                                    format!(
                                        "{op} failed (attempt {attempt}/{attempts}), retrying in {}ms",
                                        delay.as_millis()
                                    ),
                                )
                                .with_code(err.platform_code())
                                .with_detail(&err),
                        );
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Wraps a port so every operation goes through a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryingIoPort<P> {
    inner: P,
    policy: RetryPolicy,
    logger: Logger,
}

impl<P: IoPort> RetryingIoPort<P> {
    #[must_use]
    pub fn new(inner: P, policy: RetryPolicy, logger: &Logger) -> Self {
        Self {
            inner,
            policy,
            logger: logger.child("io"),
        }
    }

    #[must_use]
    pub const fn inner(&self) -> &P {
        &self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: IoPort> IoPort for RetryingIoPort<P> {
    fn extents_of(&self, path: &Path) -> Result<ExtentMap> {
        self.policy
            .run("extent query", &self.logger, || self.inner.extents_of(path))
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        self.policy
            .run("read", &self.logger, || self.inner.read(extent, buf))
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        self.policy
            .run("write", &self.logger, || self.inner.write(extent, buf))
    }

    fn flush(&self) -> Result<()> {
        self.policy.run("flush", &self.logger, || self.inner.flush())
    }
}
