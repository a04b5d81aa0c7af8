use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::shared::{IntoConnectOptions, ValidationError};

const fn default_redshift_port() -> u16 {
    RedshiftConnectionConfig::DEFAULT_PORT
}

fn default_redshift_schema() -> String {
    RedshiftConnectionConfig::DEFAULT_SCHEMA.to_string()
}

/// Target warehouse of the replication.
///
/// Does not implement `Serialize` so secrets cannot leak into serialized forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseConfig {
    /// Google BigQuery. Staging storage must be a `gs://` URI.
    BigQuery {
        project_id: String,
        dataset_id: String,
        /// Service account key JSON. When absent, `service_account_key_path` or application
        /// default credentials are used.
        service_account_key: Option<SecretString>,
        service_account_key_path: Option<String>,
    },
    /// Amazon Redshift. Staging storage must be an `s3://` URI.
    Redshift {
        #[serde(flatten)]
        connection: RedshiftConnectionConfig,
    },
    /// In-process warehouse, useful for local runs and tests.
    Memory,
    /// No warehouse: the snapshot and the change stream are only written to staging storage.
    StorageOnly,
}

impl WarehouseConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            WarehouseConfig::BigQuery {
                project_id,
                dataset_id,
                ..
            } => {
                if project_id.is_empty() || dataset_id.is_empty() {
                    return Err(ValidationError::InvalidFieldValue {
                        field: "warehouse.big_query".to_string(),
                        constraint: "`project_id` and `dataset_id` must not be empty".to_string(),
                    });
                }
                Ok(())
            }
            WarehouseConfig::Redshift { connection } => connection.validate(),
            WarehouseConfig::Memory | WarehouseConfig::StorageOnly => Ok(()),
        }
    }
}

/// Connection settings for a Redshift cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedshiftConnectionConfig {
    pub host: String,
    #[serde(default = "default_redshift_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<SecretString>,
    /// Target schema for replicated tables.
    #[serde(default = "default_redshift_schema")]
    pub schema: String,
    /// IAM role used by `COPY`. When absent, the storage access keys are passed instead.
    pub iam_role: Option<String>,
}

impl RedshiftConnectionConfig {
    pub const DEFAULT_PORT: u16 = 5439;

    pub const DEFAULT_SCHEMA: &'static str = "public";

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() || self.database.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "warehouse.redshift".to_string(),
                constraint: "`host` and `database` must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

impl IntoConnectOptions<PgConnectOptions> for RedshiftConnectionConfig {
    fn without_db(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.database)
            .ssl_mode(PgSslMode::Require);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}
