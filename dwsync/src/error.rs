//! Error types and result definitions for replication operations.
//!
//! [`SyncError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail (the operation and staged artifact involved), the originating error and the
//! callsite. Failures of several concurrent workers are aggregated into a single error.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the replication engine.
///
/// Either a single classified failure or an aggregate of several, for example when more than
/// one snapshot worker fails.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Classification of failures.
///
/// The retry behavior of each kind is decided in [`crate::policy`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration errors
    ConfigError,
    InvalidStorageUri,

    // Connectivity errors
    SourceConnectionFailed,
    StorageConnectionFailed,
    DestinationConnectionFailed,
    ChangefeedServiceFailed,
    Timeout,
    AuthenticationError,

    // Source errors
    SourceQueryFailed,
    SchemaIntrospectionError,

    // Schema errors
    SchemaError,
    PreconditionError,
    DdlExecutionFailed,
    PartialDdl,

    // Load errors
    LoadError,
    MergeFailed,
    DestinationQueryFailed,
    StorageOperationFailed,
    ChangefeedRejected,

    // Data errors
    InvalidData,
    ConversionError,

    // IO & serialization errors
    IoError,
    SerializationError,
    DeserializationError,

    // State errors
    InvalidState,
    SnapshotWorkerPanic,

    Unknown,

    // Error kinds raised by fault injection to trigger a specific retry behavior.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

impl SyncError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns the dynamic detail, or the first detail found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, if this is an aggregate.
    pub fn errors(&self) -> Option<&[SyncError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. No effect on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Prefixes the detail with the operation and artifact that failed.
    ///
    /// The kind and source are preserved so the retry classification does not change.
    pub fn context(mut self, context: impl Into<Cow<'static, str>>) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            let context = context.into();
            payload.detail = Some(match payload.detail.take() {
                Some(detail) => Cow::Owned(format!("{context}: {detail}")),
                None => context,
            });
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Eq for SyncError {}

impl Hash for SyncError {
    /// Hashes the kind and static description only, so occurrences of the same failure group
    /// together regardless of location or detail.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_indented(f, "Detail", payload.detail.as_deref())?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace", Some(&backtrace))?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, block: Option<&str>) -> fmt::Result {
    let Some(block) = block else {
        return Ok(());
    };

    if block.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in block.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();

        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Builds a single error from a foreign error, keeping it as source and its message as detail.
#[track_caller]
fn wrap<E>(kind: ErrorKind, description: &'static str, err: E) -> SyncError
where
    E: error::Error + Send + Sync + 'static,
{
    let detail = err.to_string();
    SyncError::from_components(
        kind,
        Cow::Borrowed(description),
        Some(Cow::Owned(detail)),
        Some(Arc::new(err)),
    )
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        wrap(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };
        wrap(kind, description, err)
    }
}

impl From<std::num::ParseIntError> for SyncError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> SyncError {
        wrap(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<std::str::Utf8Error> for SyncError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> SyncError {
        wrap(ErrorKind::ConversionError, "UTF-8 conversion failed", err)
    }
}

/// Maps source database errors. Warehouse connectors classify their own sqlx errors.
impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => ErrorKind::SourceConnectionFailed,
            sqlx::Error::Configuration(_) => ErrorKind::ConfigError,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                ErrorKind::ConversionError
            }
            _ => ErrorKind::SourceQueryFailed,
        };
        wrap(kind, "Source database operation failed", err)
    }
}

impl From<object_store::Error> for SyncError {
    #[track_caller]
    fn from(err: object_store::Error) -> SyncError {
        let (kind, description) = match &err {
            object_store::Error::NotFound { .. } => (
                ErrorKind::StorageOperationFailed,
                "Object not found in staging storage",
            ),
            object_store::Error::Unauthenticated { .. }
            | object_store::Error::PermissionDenied { .. } => (
                ErrorKind::AuthenticationError,
                "Staging storage rejected the credentials",
            ),
            object_store::Error::Generic { .. } => (
                ErrorKind::StorageConnectionFailed,
                "Staging storage request failed",
            ),
            _ => (
                ErrorKind::StorageOperationFailed,
                "Staging storage operation failed",
            ),
        };
        wrap(kind, description, err)
    }
}

impl From<object_store::path::Error> for SyncError {
    #[track_caller]
    fn from(err: object_store::path::Error) -> SyncError {
        wrap(ErrorKind::InvalidStorageUri, "Invalid object path", err)
    }
}

impl From<csv::Error> for SyncError {
    #[track_caller]
    fn from(err: csv::Error) -> SyncError {
        let kind = if err.is_io_error() {
            ErrorKind::IoError
        } else {
            ErrorKind::InvalidData
        };
        wrap(kind, "CSV processing failed", err)
    }
}

impl From<url::ParseError> for SyncError {
    #[track_caller]
    fn from(err: url::ParseError) -> SyncError {
        wrap(ErrorKind::InvalidStorageUri, "URI parsing failed", err)
    }
}

impl From<reqwest::Error> for SyncError {
    #[track_caller]
    fn from(err: reqwest::Error) -> SyncError {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorKind::ChangefeedServiceFailed
        } else if err.is_decode() {
            ErrorKind::DeserializationError
        } else {
            ErrorKind::ChangefeedRejected
        };
        wrap(kind, "CDC service request failed", err)
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> SyncError {
        wrap(ErrorKind::Timeout, "Operation timed out", err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::sync_error;

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err: SyncError = vec![sync_error!(ErrorKind::LoadError, "load failed")].into();
        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::LoadError);
    }

    #[test]
    fn aggregate_reports_all_kinds() {
        let err: SyncError = vec![
            sync_error!(ErrorKind::SourceConnectionFailed, "a"),
            sync_error!(ErrorKind::LoadError, "b"),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceConnectionFailed, ErrorKind::LoadError]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn context_prefixes_detail_and_keeps_kind() {
        let err = sync_error!(ErrorKind::LoadError, "Load failed", "row 3 is malformed")
            .context("load_increment db1/orders/1/CDC000001.csv");

        assert_eq!(err.kind(), ErrorKind::LoadError);
        assert_eq!(
            err.detail(),
            Some("load_increment db1/orders/1/CDC000001.csv: row 3 is malformed")
        );
    }

    #[test]
    fn hash_ignores_detail() {
        let mut set = HashSet::new();
        set.insert(sync_error!(ErrorKind::Timeout, "Operation timed out", "a"));
        set.insert(sync_error!(ErrorKind::Timeout, "Operation timed out", "b"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn display_includes_detail_block() {
        let err = sync_error!(ErrorKind::PartialDdl, "DDL partially applied", "ALTER 1\nALTER 2");
        let rendered = err.to_string();
        assert!(rendered.contains("[PartialDdl] DDL partially applied"));
        assert!(rendered.contains("\n  Detail:\n    ALTER 1\n    ALTER 2"));
    }
}
