use std::future::Future;
use std::time::Duration;

use dwsync_config::shared::RetryConfig;
use metrics::counter;
use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{error, warn};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::metrics::{DWSYNC_RETRIES_TOTAL, TABLE_LABEL};
use crate::policy::build_error_handling_policy;
use crate::sync_error;

/// Delay before retry number `attempt`, counted from 1.
///
/// Grows by `backoff_factor` from `initial_delay_ms`, capped at `max_delay_ms`, plus up to 30%
/// of random jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base_delay_ms = config.initial_delay_ms as f64 * config.backoff_factor.powi(exponent);
    let capped_delay_ms = base_delay_ms.min(config.max_delay_ms as f64);

    let jitter_factor = rand::thread_rng().gen_range(0.0..0.3);

    Duration::from_millis((capped_delay_ms * (1.0 + jitter_factor)) as u64)
}

/// Runs `future` with a deadline; an elapsed deadline is an [`ErrorKind::Timeout`].
pub async fn with_timeout<T, F>(deadline: Duration, operation: &str, future: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(sync_error!(
            ErrorKind::Timeout,
            "Operation timed out",
            format!("{operation} did not complete within {}ms", deadline.as_millis())
        )),
    }
}

/// Retry bookkeeping of one operation.
///
/// The caller runs the operation in a loop and hands every failure to [`Retry::backoff`],
/// which either sleeps before the next attempt or gives the error back.
#[derive(Debug)]
pub struct Retry<'a> {
    config: &'a RetryConfig,
    table: &'a str,
    operation: &'static str,
    attempts: u32,
}

impl<'a> Retry<'a> {
    pub fn new(config: &'a RetryConfig, table: &'a str, operation: &'static str) -> Self {
        Self {
            config,
            table,
            operation,
            attempts: 0,
        }
    }

    /// Sleeps before the next attempt, or returns `err` when the policy does not retry it or
    /// the attempts are exhausted.
    pub async fn backoff(&mut self, err: SyncError) -> SyncResult<()> {
        self.attempts += 1;

        let policy = build_error_handling_policy(&err);
        if !policy.is_retryable() || self.attempts >= self.config.max_attempts {
            error!(
                table = self.table,
                operation = self.operation,
                attempts = self.attempts,
                error = %err,
                solution = policy.solution().unwrap_or_default(),
                "operation failed"
            );

            return Err(err);
        }

        let delay = backoff_delay(self.config, self.attempts);
        warn!(
            table = self.table,
            operation = self.operation,
            attempts = self.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );
        counter!(
            DWSYNC_RETRIES_TOTAL,
            TABLE_LABEL => self.table.to_string(),
            "operation" => self.operation
        )
        .increment(1);

        sleep(delay).await;

        Ok(())
    }
}
