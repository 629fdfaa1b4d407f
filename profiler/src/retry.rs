//! Retry with exponential backoff, per-call timeouts, and cooperative
//! cancellation for connector calls.

use std::time::Duration;

use rand::Rng;
use tokio::runtime::{Builder, Runtime};
use tracing::warn;

pub use tokio_util::sync::CancellationToken;

use crate::connector::ConnectorError;
use crate::{Error, Result};

/// `Err(Cancelled)` once `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs blocking connector calls under a deadline, and sleeps that wake
/// early on cancellation.
///
/// A call that times out is abandoned. It keeps its blocking thread until
/// it returns, and its result is dropped; dropping the runtime does not
/// wait for it.
pub struct CallRuntime {
    runtime: Option<Runtime>,
    timeout: Duration,
}

impl CallRuntime {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("connector-call")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` on the blocking pool and wait at most `timeout` for it.
    pub fn call<T, F>(&self, f: F) -> std::result::Result<T, ConnectorError>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, ConnectorError> + Send + 'static,
    {
        let Some(runtime) = &self.runtime else {
            return Err(ConnectorError::Unreachable("call runtime shut down".to_string()));
        };
        let timeout = self.timeout;

        runtime.block_on(async move {
            let task = tokio::task::spawn_blocking(f);
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ConnectorError::Query("connector call panicked".to_string())),
                Err(_) => Err(ConnectorError::Timeout(timeout)),
            }
        })
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns false if cancelled.
    pub fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        let Some(runtime) = &self.runtime else {
            return !cancel.is_cancelled();
        };
        runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(duration) => true,
            }
        })
    }
}

impl Drop for CallRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// How connector calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub limit: u32,

    /// Delay before the first retry; doubled for each further one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay: Duration) -> Self {
        Self { limit, base_delay }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Backoff plus up to 50% random jitter.
    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let max_jitter = (delay.as_millis() / 2) as u64;
        if max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    /// Call `op` until it succeeds, fails with a non-retryable error, or the
    /// retry limit is exhausted. Backoff sleeps run on `calls`.
    pub fn call<T>(
        &self,
        calls: &CallRuntime,
        source_name: &str,
        operation: &str,
        cancel: &CancellationToken,
        op: impl FnMut() -> std::result::Result<T, ConnectorError>,
    ) -> Result<T> {
        self.call_with_heartbeat(calls, source_name, operation, cancel, || Ok(()), op)
    }

    /// Like `call`, but runs `heartbeat` after each backoff sleep, before the
    /// next attempt. A failing heartbeat ends the retries with its error.
    pub fn call_with_heartbeat<T>(
        &self,
        calls: &CallRuntime,
        source_name: &str,
        operation: &str,
        cancel: &CancellationToken,
        mut heartbeat: impl FnMut() -> Result<()>,
        mut op: impl FnMut() -> std::result::Result<T, ConnectorError>,
    ) -> Result<T> {
        let mut retries = 0;
        loop {
            ensure_active(cancel)?;

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.limit => {
                    retries += 1;
                    let delay = self.jittered(retries);
                    warn!(
                        source = source_name,
                        "{} failed ({}), retry {}/{} in {:?}",
                        operation,
                        e,
                        retries,
                        self.limit,
                        delay
                    );
                    if !calls.sleep(delay, cancel) {
                        return Err(Error::Cancelled);
                    }
                    heartbeat()?;
                }
                Err(e) => {
                    let message = if retries > 0 {
                        format!("{} failed after {} retries: {}", operation, retries, e)
                    } else {
                        format!("{} failed: {}", operation, e)
                    };
                    return Err(Error::Connection {
                        source_name: source_name.to_string(),
                        message,
                    });
                }
            }
        }
    }
}
