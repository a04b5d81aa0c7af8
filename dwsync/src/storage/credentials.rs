use dwsync_config::shared::StorageCredentialsConfig;
use secrecy::SecretString;
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::storage::{StorageScheme, StorageUri};

const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Variables that let the AWS default chain find credentials without static keys.
const AWS_AMBIENT_VARIABLES: [&str; 4] = [
    "AWS_PROFILE",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
];

/// Credentials used to access staging storage.
///
/// Resolved once at startup. Secret material is never logged; `Debug` is redacted.
#[derive(Debug, Clone)]
pub enum StorageCredentials {
    AccessKey {
        access_key_id: SecretString,
        secret_access_key: SecretString,
        session_token: Option<SecretString>,
    },
    ServiceAccountKey {
        path: String,
    },
    /// Left to the provider's own discovery (instance metadata, workload identity).
    Ambient,
    /// Local and in-memory stores need no credentials.
    None,
}

impl StorageCredentials {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageCredentials::AccessKey { .. } => "access_key",
            StorageCredentials::ServiceAccountKey { .. } => "service_account_key",
            StorageCredentials::Ambient => "ambient",
            StorageCredentials::None => "none",
        }
    }
}

/// Resolves credentials for `uri` from explicit configuration or the process environment.
pub fn resolve_credentials(
    uri: &StorageUri,
    explicit: Option<&StorageCredentialsConfig>,
) -> SyncResult<StorageCredentials> {
    resolve_credentials_with(uri, explicit, |name| std::env::var(name).ok())
}

/// Same as [`resolve_credentials`] with an injectable environment lookup.
pub fn resolve_credentials_with<F>(
    uri: &StorageUri,
    explicit: Option<&StorageCredentialsConfig>,
    env: F,
) -> SyncResult<StorageCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let env = |name: &str| env(name).filter(|value| !value.is_empty());

    let credentials = match (uri.scheme(), explicit) {
        (StorageScheme::File | StorageScheme::Memory, _) => StorageCredentials::None,
        (
            StorageScheme::S3,
            Some(StorageCredentialsConfig::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            }),
        ) => StorageCredentials::AccessKey {
            access_key_id: access_key_id.clone(),
            secret_access_key: secret_access_key.clone(),
            session_token: session_token.clone(),
        },
        (StorageScheme::Gcs, Some(StorageCredentialsConfig::ServiceAccountKeyPath { path })) => {
            StorageCredentials::ServiceAccountKey { path: path.clone() }
        }
        (scheme, Some(_)) => bail!(
            ErrorKind::ConfigError,
            "Storage credentials do not match the storage provider",
            format!("{scheme:?} storage at {uri}")
        ),
        (StorageScheme::S3, None) => {
            match (env(AWS_ACCESS_KEY_ID), env(AWS_SECRET_ACCESS_KEY)) {
                (Some(access_key_id), Some(secret_access_key)) => StorageCredentials::AccessKey {
                    access_key_id: SecretString::new(access_key_id),
                    secret_access_key: SecretString::new(secret_access_key),
                    session_token: env(AWS_SESSION_TOKEN).map(SecretString::new),
                },
                _ if AWS_AMBIENT_VARIABLES.iter().any(|name| env(name).is_some()) => {
                    StorageCredentials::Ambient
                }
                _ => bail!(
                    ErrorKind::ConfigError,
                    "No credentials found for S3 staging storage",
                    format!(
                        "{uri}: configure storage.credentials or set {AWS_ACCESS_KEY_ID} and {AWS_SECRET_ACCESS_KEY}"
                    )
                ),
            }
        }
        (StorageScheme::Gcs, None) => match env(GOOGLE_APPLICATION_CREDENTIALS) {
            Some(path) => StorageCredentials::ServiceAccountKey { path },
            None => StorageCredentials::Ambient,
        },
    };

    debug!(storage = %uri, credentials = credentials.kind(), "resolved storage credentials");

    Ok(credentials)
}
