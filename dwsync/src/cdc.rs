//! Client of the CDC service's changefeed API.
//!
//! A changefeed captures the changes of one table from a start timestamp and writes them as
//! CSV change batches below the incremental staging path.

use std::time::Duration;

use dwsync_config::shared::ChangefeedConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::NULL_MARKER;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::storage::StorageUri;
use crate::sync_error;
use crate::types::{SourceTs, TableName};

const CHANGEFEEDS_PATH: &str = "/api/v2/changefeeds";

/// Deadline of a single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Changefeed id derived from a table name; ids only allow alphanumerics separated by `-`.
pub fn changefeed_id_for(table: &TableName) -> String {
    let raw = format!("dwsync-{}-{}", table.database, table.name);
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Sink URI handed to the CDC service for the incremental location.
pub fn sink_uri(increment: &StorageUri, config: &ChangefeedConfig) -> String {
    let mut uri = format!(
        "{increment}?protocol=csv&flush-interval={}s&file-size={}",
        config.flush_interval_secs, config.file_size_bytes
    );
    if let Some(region) = increment.region() {
        uri.push_str(&format!("&region={region}"));
    }
    if let Some(endpoint) = increment.endpoint() {
        uri.push_str(&format!("&endpoint={endpoint}"));
    }

    uri
}

#[derive(Debug, Clone, Serialize)]
struct CreateChangefeedRequest {
    changefeed_id: String,
    sink_uri: String,
    start_ts: SourceTs,
    replica_config: ReplicaConfig,
}

#[derive(Debug, Clone, Serialize)]
struct ReplicaConfig {
    filter: FilterConfig,
    sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize)]
struct FilterConfig {
    rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SinkConfig {
    protocol: &'static str,
    csv: CsvConfig,
    date_separator: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CsvConfig {
    delimiter: &'static str,
    quote: &'static str,
    null: &'static str,
    include_commit_ts: bool,
}

/// State of a changefeed as reported by the CDC service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangefeedStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub checkpoint_ts: u64,
    #[serde(default)]
    pub error: Option<ChangefeedFailure>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangefeedFailure {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Error body of the CDC service API.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_msg: String,
    #[serde(default)]
    error_code: String,
}

/// HTTP client of the changefeed API.
#[derive(Debug, Clone)]
pub struct ChangefeedClient {
    client: reqwest::Client,
    api_url: String,
    config: ChangefeedConfig,
}

impl ChangefeedClient {
    pub fn new(config: ChangefeedConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                sync_error!(
                    ErrorKind::ConfigError,
                    "CDC service client could not be built",
                    err.to_string(),
                    source: err
                )
            })?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    /// Id of the changefeed of `table`, configured or derived.
    pub fn changefeed_id(&self, table: &TableName) -> String {
        self.config
            .changefeed_id
            .clone()
            .unwrap_or_else(|| changefeed_id_for(table))
    }

    fn changefeed_url(&self, id: &str) -> String {
        format!("{}{CHANGEFEEDS_PATH}/{id}", self.api_url)
    }

    /// Creates the changefeed of `table`, starting at `start_ts` and writing to `increment`.
    pub async fn create(
        &self,
        table: &TableName,
        increment: &StorageUri,
        start_ts: SourceTs,
    ) -> SyncResult<ChangefeedStatus> {
        let request = CreateChangefeedRequest {
            changefeed_id: self.changefeed_id(table),
            sink_uri: sink_uri(increment, &self.config),
            start_ts,
            replica_config: ReplicaConfig {
                filter: FilterConfig {
                    rules: vec![table.to_string()],
                },
                sink: SinkConfig {
                    protocol: "csv",
                    csv: CsvConfig {
                        delimiter: ",",
                        quote: "\"",
                        null: NULL_MARKER,
                        include_commit_ts: true,
                    },
                    date_separator: "none",
                },
            },
        };

        let response = self
            .client
            .post(format!("{}{CHANGEFEEDS_PATH}", self.api_url))
            .json(&request)
            .send()
            .await?;
        let status: ChangefeedStatus = check_response(response).await?.json().await?;

        info!(
            changefeed_id = %request.changefeed_id,
            %table,
            start_ts,
            sink = %increment,
            "created changefeed"
        );

        Ok(status)
    }

    /// Returns the changefeed `id`, or `None` when it does not exist.
    pub async fn get(&self, id: &str) -> SyncResult<Option<ChangefeedStatus>> {
        let response = self.client.get(self.changefeed_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status: ChangefeedStatus = check_response(response).await?.json().await?;
        if let Some(failure) = &status.error {
            warn!(changefeed_id = id, code = %failure.code, message = %failure.message, "changefeed reports an error");
        }

        Ok(Some(status))
    }

    /// Removes the changefeed `id`. A missing changefeed is not an error.
    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        let response = self.client.delete(self.changefeed_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(response).await?;

        info!(changefeed_id = id, "removed changefeed");

        Ok(())
    }

    /// Replaces any changefeed of `table` with one starting at `start_ts`.
    pub async fn recreate(
        &self,
        table: &TableName,
        increment: &StorageUri,
        start_ts: SourceTs,
    ) -> SyncResult<ChangefeedStatus> {
        let id = self.changefeed_id(table);
        if self.get(&id).await?.is_some() {
            info!(changefeed_id = %id, "removing existing changefeed before recreating it");
            self.delete(&id).await?;
        }

        self.create(table, increment, start_ts).await
    }
}

async fn check_response(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &url, &body))
}

fn api_error(status: StatusCode, url: &str, body: &str) -> SyncError {
    let api_error: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = if api_error.error_msg.is_empty() {
        body.to_string()
    } else {
        format!("{} ({})", api_error.error_msg, api_error.error_code)
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        sync_error!(
            ErrorKind::ChangefeedServiceFailed,
            "CDC service is unavailable",
            format!("{status} from {url}: {message}")
        )
    } else {
        sync_error!(
            ErrorKind::ChangefeedRejected,
            "CDC service rejected the request",
            format!("{status} from {url}: {message}")
        )
    }
}
