use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};

use crate::shared::ValidationError;

const fn default_port() -> u16 {
    TiDbConnectionConfig::DEFAULT_PORT
}

const fn default_max_connections() -> u32 {
    TiDbConnectionConfig::DEFAULT_MAX_CONNECTIONS
}

/// Connection settings for the TiDB (MySQL protocol) source cluster.
///
/// Does not implement `Serialize` so the password cannot leak into serialized forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TiDbConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    /// Upper bound of pooled connections. Snapshot workers each hold one while reading a shard.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl TiDbConnectionConfig {
    pub const DEFAULT_PORT: u16 = 4000;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.host".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.max_connections".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        self.tls.validate()
    }
}

/// TLS settings for the source connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
    #[serde(default)]
    pub enabled: bool,
}

impl TlsConfig {
    /// Fails with [`ValidationError::MissingTrustedRootCerts`] when TLS is enabled without roots.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Converts a connection config into driver specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Options that do not select a default database.
    fn without_db(&self) -> Output;
}

impl IntoConnectOptions<MySqlConnectOptions> for TiDbConnectionConfig {
    fn without_db(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .charset("utf8mb4");

        if self.tls.enabled {
            options = options
                .ssl_mode(MySqlSslMode::VerifyCa)
                .ssl_ca_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        } else {
            options = options.ssl_mode(MySqlSslMode::Preferred);
        }

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}
