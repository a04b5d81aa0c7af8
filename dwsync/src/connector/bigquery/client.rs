use std::fmt;
use std::time::Duration;

use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::{QueryResponse, ResultSet};
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::{bail, sync_error};

/// Time a query call waits server side for its job before returning.
const QUERY_WAIT_MS: i32 = 30_000;
/// Initial delay between two polls of a running job.
const INITIAL_POLL_DELAY_MS: u64 = 500;
/// Maximum delay between two polls of a running job.
const MAX_POLL_DELAY_MS: u64 = 10_000;

/// BigQuery project identifier.
pub type BigQueryProjectId = String;
/// BigQuery dataset identifier.
pub type BigQueryDatasetId = String;

/// Converts BigQuery errors to sync errors with the classification used by the retry policy.
pub fn bq_error_to_sync_error(err: BQError) -> SyncError {
    let (kind, description) = match &err {
        BQError::InvalidServiceAccountKey(_) => (
            ErrorKind::AuthenticationError,
            "Invalid BigQuery service account key",
        ),
        BQError::InvalidServiceAccountAuthenticator(_) => (
            ErrorKind::AuthenticationError,
            "Invalid BigQuery service account authenticator",
        ),
        BQError::InvalidApplicationDefaultCredentialsAuthenticator(_) => (
            ErrorKind::AuthenticationError,
            "Invalid BigQuery application default credentials",
        ),
        BQError::AuthError(_) | BQError::YupAuthError(_) | BQError::NoToken => (
            ErrorKind::AuthenticationError,
            "BigQuery authentication error",
        ),

        BQError::RequestError(_) | BQError::TonicTransportError(_) => (
            ErrorKind::DestinationConnectionFailed,
            "BigQuery request failed",
        ),

        BQError::ResponseError { error } => match error.error.code {
            401 | 403 => (
                ErrorKind::AuthenticationError,
                "BigQuery rejected the credentials",
            ),
            429 | 500 | 502 | 503 | 504 => (
                ErrorKind::DestinationConnectionFailed,
                "BigQuery is temporarily unavailable",
            ),
            _ => (ErrorKind::DestinationQueryFailed, "BigQuery response error"),
        },

        BQError::SerializationError(_) => (
            ErrorKind::SerializationError,
            "BigQuery JSON serialization error",
        ),
        BQError::NoDataAvailable
        | BQError::InvalidColumnIndex { .. }
        | BQError::InvalidColumnName { .. }
        | BQError::InvalidColumnType { .. } => {
            (ErrorKind::InvalidData, "BigQuery result could not be read")
        }

        _ => (ErrorKind::DestinationQueryFailed, "BigQuery operation failed"),
    };

    sync_error!(kind, description, err.to_string())
}

/// Exponential poll delay with full jitter.
fn poll_delay(attempt: u32) -> Duration {
    let exponential = INITIAL_POLL_DELAY_MS
        .saturating_mul(1u64 << attempt.min(10))
        .min(MAX_POLL_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=exponential);

    Duration::from_millis(jitter)
}

/// Client running query jobs against one BigQuery project.
#[derive(Clone)]
pub struct BigQueryClient {
    project_id: BigQueryProjectId,
    client: Client,
}

impl BigQueryClient {
    /// Creates a new [`BigQueryClient`] from a service account key file.
    pub async fn new_with_key_path(
        project_id: BigQueryProjectId,
        sa_key_file: &str,
    ) -> SyncResult<BigQueryClient> {
        let client = ClientBuilder::new()
            .build_from_service_account_key_file(sa_key_file)
            .await
            .map_err(bq_error_to_sync_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    /// Creates a new [`BigQueryClient`] from a service account key JSON string.
    pub async fn new_with_key(
        project_id: BigQueryProjectId,
        sa_key: &str,
    ) -> SyncResult<BigQueryClient> {
        let sa_key = parse_service_account_key(sa_key)
            .map_err(BQError::from)
            .map_err(bq_error_to_sync_error)?;
        let client = ClientBuilder::new()
            .build_from_service_account_key(sa_key, false)
            .await
            .map_err(bq_error_to_sync_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    /// Creates a new [`BigQueryClient`] using Application Default Credentials.
    pub async fn new_with_adc(project_id: BigQueryProjectId) -> SyncResult<BigQueryClient> {
        let client = ClientBuilder::new()
            .build_from_application_default_credentials()
            .await
            .map_err(bq_error_to_sync_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Runs `sql` and waits for its job to finish.
    ///
    /// DDL, DML and load statements can outlive a single query call, in which case the job is
    /// polled until it is done.
    pub async fn execute(&self, sql: &str) -> SyncResult<()> {
        let response = self.submit(sql).await?;
        if response.job_complete.unwrap_or(true) {
            return Ok(());
        }

        let Some(job_reference) = response.job_reference else {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "BigQuery job did not complete and has no reference",
                sql
            );
        };
        let Some(job_id) = job_reference.job_id else {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "BigQuery job did not complete and has no id",
                sql
            );
        };

        self.wait_for_job(&job_id, job_reference.location.as_deref())
            .await
    }

    /// Runs a query and returns its result set.
    pub async fn query(&self, sql: &str) -> SyncResult<ResultSet> {
        let response = self.submit(sql).await?;
        Ok(ResultSet::new_from_query_response(response))
    }

    /// Runs a query returning a single integer.
    pub async fn query_i64(&self, sql: &str) -> SyncResult<i64> {
        let mut result_set = self.query(sql).await?;
        if !result_set.next_row() {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "BigQuery query returned no rows",
                sql
            );
        }

        let value = result_set
            .get_i64(0)
            .map_err(bq_error_to_sync_error)?
            .unwrap_or_default();

        Ok(value)
    }

    async fn submit(&self, sql: &str) -> SyncResult<QueryResponse> {
        debug!(sql, "running bigquery query");

        let mut request = QueryRequest::new(sql.to_string());
        request.timeout_ms = Some(QUERY_WAIT_MS);

        self.client
            .job()
            .query(&self.project_id, request)
            .await
            .map_err(bq_error_to_sync_error)
    }

    async fn wait_for_job(&self, job_id: &str, location: Option<&str>) -> SyncResult<()> {
        let mut attempt = 0;
        loop {
            sleep(poll_delay(attempt)).await;
            attempt = attempt.saturating_add(1);

            let job = self
                .client
                .job()
                .get_job(&self.project_id, job_id, location)
                .await
                .map_err(bq_error_to_sync_error)?;

            let Some(status) = job.status else {
                continue;
            };
            if let Some(error) = status.error_result {
                bail!(
                    ErrorKind::DestinationQueryFailed,
                    "BigQuery job failed",
                    format!(
                        "job {job_id}: {}",
                        error.message.unwrap_or_else(|| "no message".to_string())
                    )
                );
            }
            if status.state.as_deref() == Some("DONE") {
                info!(job_id, polls = attempt, "bigquery job done");
                return Ok(());
            }
        }
    }
}

impl fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_delay_is_capped() {
        for attempt in 0..20 {
            assert!(poll_delay(attempt) <= Duration::from_millis(MAX_POLL_DELAY_MS));
        }
    }

    #[test]
    fn classifies_authentication_and_result_errors() {
        let err = bq_error_to_sync_error(BQError::NoToken);
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);

        let err = bq_error_to_sync_error(BQError::NoDataAvailable);
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
