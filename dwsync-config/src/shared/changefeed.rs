use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

const fn default_flush_interval_secs() -> u64 {
    ChangefeedConfig::DEFAULT_FLUSH_INTERVAL_SECS
}

const fn default_file_size_bytes() -> u64 {
    ChangefeedConfig::DEFAULT_FILE_SIZE_BYTES
}

/// Settings for the changefeed created on the CDC service.
///
/// When present, a `full` run creates a changefeed starting at the snapshot timestamp that
/// writes change batches to the incremental staging path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChangefeedConfig {
    /// Base URL of the CDC service API, e.g. `http://127.0.0.1:8300`.
    pub api_url: String,
    /// Changefeed id. Defaults to one derived from the table name.
    pub changefeed_id: Option<String>,
    /// Interval at which the CDC service flushes change batches to storage.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Maximum size of a single change batch file.
    #[serde(default = "default_file_size_bytes")]
    pub file_size_bytes: u64,
}

impl ChangefeedConfig {
    pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

    pub const DEFAULT_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ValidationError::InvalidFieldValue {
                field: "changefeed.api_url".to_string(),
                constraint: "must be an http(s) URL".to_string(),
            });
        }

        if self.flush_interval_secs == 0 || self.file_size_bytes == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "changefeed".to_string(),
                constraint: "`flush_interval_secs` and `file_size_bytes` must be greater than 0"
                    .to_string(),
            });
        }

        Ok(())
    }
}
