//! Retry classification of [`SyncError`]s.

use crate::error::{ErrorKind, SyncError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// Retried automatically with exponential backoff.
    Timed,
    /// Aborts the run.
    NoRetry,
}

/// Policy describing how a [`SyncError`] is handled by the orchestrator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an operator-facing hint for errors that abort the run.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_directive == RetryDirective::Timed
    }
}

/// Classifies an error. Aggregates are retryable only when every contained error is.
pub fn build_error_handling_policy(error: &SyncError) -> ErrorHandlingPolicy {
    let kinds = error.kinds();
    if kinds.is_empty() {
        return policy_for_kind(ErrorKind::Unknown);
    }

    kinds
        .into_iter()
        .map(policy_for_kind)
        .find(|policy| !policy.is_retryable())
        .unwrap_or(ErrorHandlingPolicy::new(RetryDirective::Timed, None))
}

fn policy_for_kind(kind: ErrorKind) -> ErrorHandlingPolicy {
    match kind {
        // Transient failures of an external system. Retrying the same batch is always safe
        // because merges are idempotent.
        ErrorKind::SourceConnectionFailed
        | ErrorKind::StorageConnectionFailed
        | ErrorKind::DestinationConnectionFailed
        | ErrorKind::ChangefeedServiceFailed
        | ErrorKind::Timeout
        | ErrorKind::LoadError
        | ErrorKind::MergeFailed
        | ErrorKind::DestinationQueryFailed
        | ErrorKind::StorageOperationFailed => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        ErrorKind::ConfigError | ErrorKind::InvalidStorageUri => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the replicator configuration and restart."),
        ),
        ErrorKind::AuthenticationError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Verify the credentials of the source, staging storage and warehouse."),
        ),
        ErrorKind::SchemaError | ErrorKind::PartialDdl | ErrorKind::DdlExecutionFailed => {
            ErrorHandlingPolicy::new(
                RetryDirective::NoRetry,
                Some(
                    "Reconcile the warehouse table schema with the source table, then restart in incremental-only mode.",
                ),
            )
        }
        ErrorKind::PreconditionError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("The incremental path starts with a DDL; run a snapshot first or restart in full mode."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        _ => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("There is no single prescribed solution for this error, inspect the error detail."),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> SyncError {
        SyncError::from((kind, "test error"))
    }

    #[test]
    fn connectivity_and_timeouts_are_retried() {
        for kind in [
            ErrorKind::SourceConnectionFailed,
            ErrorKind::StorageConnectionFailed,
            ErrorKind::DestinationConnectionFailed,
            ErrorKind::Timeout,
        ] {
            let policy = build_error_handling_policy(&err(kind));
            assert_eq!(policy.retry_directive(), RetryDirective::Timed, "{kind:?}");
            assert_eq!(policy.solution(), None);
        }
    }

    #[test]
    fn schema_failures_abort_with_guidance() {
        let policy = build_error_handling_policy(&err(ErrorKind::PartialDdl));
        assert_eq!(policy.retry_directive(), RetryDirective::NoRetry);
        assert!(policy.solution().is_some());
    }

    #[test]
    fn aggregate_with_one_fatal_error_is_fatal() {
        let error: SyncError = vec![err(ErrorKind::Timeout), err(ErrorKind::ConfigError)].into();
        assert!(!build_error_handling_policy(&error).is_retryable());

        let error: SyncError = vec![err(ErrorKind::Timeout), err(ErrorKind::LoadError)].into();
        assert!(build_error_handling_policy(&error).is_retryable());
    }
}
