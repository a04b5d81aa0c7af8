use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Staging object storage used for snapshot shards and change batches.
///
/// Snapshot files live under `<uri>/snapshot` and change batches under `<uri>/increment`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Root URI, e.g. `s3://bucket/prefix` or `gs://bucket/prefix`.
    pub uri: String,
    /// Region of an S3 bucket. Falls back to `AWS_REGION` / `AWS_DEFAULT_REGION`.
    pub region: Option<String>,
    /// Custom endpoint for S3 compatible stores.
    pub endpoint: Option<String>,
    /// Explicit credentials. When absent the provider default chain is used.
    pub credentials: Option<StorageCredentialsConfig>,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.uri.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "storage.uri".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Explicit object storage credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageCredentialsConfig {
    /// Static AWS access keys.
    AccessKey {
        access_key_id: SecretString,
        secret_access_key: SecretString,
        session_token: Option<SecretString>,
    },
    /// Path to a Google Cloud service account key file.
    ServiceAccountKeyPath { path: String },
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn deserializes_access_key_credentials() {
        let config: StorageConfig = serde_json::from_str(
            r#"{
                "uri": "s3://bucket/prefix",
                "region": "us-west-2",
                "credentials": {"access_key": {"access_key_id": "AKIA", "secret_access_key": "s3cr3t"}}
            }"#,
        )
        .unwrap();

        match config.credentials {
            Some(StorageCredentialsConfig::AccessKey {
                access_key_id,
                session_token,
                ..
            }) => {
                assert_eq!(access_key_id.expose_secret(), "AKIA");
                assert!(session_token.is_none());
            }
            other => panic!("unexpected credentials: {other:?}"),
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config: StorageConfig = serde_json::from_str(
            r#"{
                "uri": "s3://bucket",
                "credentials": {"access_key": {"access_key_id": "AKIA", "secret_access_key": "s3cr3t"}}
            }"#,
        )
        .unwrap();

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cr3t"));
    }

    #[test]
    fn empty_uri_is_rejected() {
        let config: StorageConfig = serde_json::from_str(r#"{"uri": " "}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
