use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// No source tables were configured for replication.
    #[error("`replication.tables` must list at least one table")]
    NoTablesConfigured,
    /// A table entry is not of the form `database.table`.
    #[error("table `{0}` must be written as `database.table`")]
    InvalidTableName(String),
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
