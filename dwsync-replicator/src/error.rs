use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use dwsync::error::SyncError;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Backtrace captured when an infrastructure error is created.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type of the replicator binary.
///
/// Wraps [`SyncError`] for replication failures and adds the failures of process setup.
#[derive(Debug)]
pub enum ReplicatorError {
    /// Replication error.
    Sync(SyncError),
    /// Configuration, tracing or metrics setup error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// I/O error, e.g. while building the runtime.
    Io(std::io::Error, CapturedBacktrace),
}

impl ReplicatorError {
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Sync(_) => "replication error",
            ReplicatorError::Config(_, _) => "configuration error",
            ReplicatorError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ReplicatorError::Sync(err) => err.backtrace(),
            ReplicatorError::Config(_, cb) => Some(&cb.0),
            ReplicatorError::Io(_, cb) => Some(&cb.0),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a report of the error for terminal output.
    ///
    /// Aggregated replication errors get one line per failure, any other error lists its
    /// chain of causes.
    pub fn render_report(&self) -> String {
        let mut lines = vec![
            "replicator failed".to_string(),
            format!("category: {}", self.category()),
        ];

        let failures = match self {
            ReplicatorError::Sync(err) => err.errors(),
            _ => None,
        };

        if let Some(failures) = failures {
            lines.push(format!("error: {} replications failed", failures.len()));
            for (idx, failure) in failures.iter().enumerate() {
                lines.push(format!("failure {}: {failure}", idx + 1));
            }
        } else {
            lines.push(format!("error: {self}"));
            let causes = std::iter::successors(Error::source(self), |err| (*err).source());
            for (idx, cause) in causes.enumerate() {
                lines.push(format!("cause {}: {cause}", idx + 1));
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            lines.push("backtrace:".to_string());
            lines.push(backtrace.to_string().trim_end().to_string());
        }

        let mut report = lines.join("\n");
        report.push('\n');
        report
    }
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Sync(err) => write!(f, "{err}"),
            ReplicatorError::Config(source, _) => write!(f, "configuration error: {source}"),
            ReplicatorError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ReplicatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicatorError::Sync(err) => err.source(),
            ReplicatorError::Config(source, _) => Some(source.as_ref()),
            ReplicatorError::Io(source, _) => Some(source),
        }
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<SyncError> for ReplicatorError {
    fn from(err: SyncError) -> Self {
        ReplicatorError::Sync(err)
    }
}
