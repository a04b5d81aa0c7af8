use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectStore, PutPayload};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::storage::{StorageCredentials, StorageScheme, StorageUri};
use crate::sync_error;

/// Builds the object store serving `uri`.
///
/// The store is rooted at the bucket; keys are produced with [`StorageUri::object_path`].
pub fn open_object_store(
    uri: &StorageUri,
    credentials: &StorageCredentials,
) -> SyncResult<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match uri.scheme() {
        StorageScheme::S3 => {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(uri.bucket());
            match credentials {
                StorageCredentials::AccessKey {
                    access_key_id,
                    secret_access_key,
                    session_token,
                } => {
                    builder = builder
                        .with_access_key_id(access_key_id.expose_secret())
                        .with_secret_access_key(secret_access_key.expose_secret());
                    if let Some(token) = session_token {
                        builder = builder.with_token(token.expose_secret());
                    }
                }
                StorageCredentials::Ambient => {}
                other => bail!(
                    ErrorKind::ConfigError,
                    "Storage credentials do not match the storage provider",
                    format!("{} credentials for {uri}", other.kind())
                ),
            }
            if let Some(region) = uri.region() {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = uri.endpoint() {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }

            Arc::new(builder.build().map_err(build_error)?)
        }
        StorageScheme::Gcs => {
            let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(uri.bucket());
            match credentials {
                StorageCredentials::ServiceAccountKey { path } => {
                    builder = builder.with_service_account_path(path);
                }
                StorageCredentials::Ambient => {}
                other => bail!(
                    ErrorKind::ConfigError,
                    "Storage credentials do not match the storage provider",
                    format!("{} credentials for {uri}", other.kind())
                ),
            }

            Arc::new(builder.build().map_err(build_error)?)
        }
        StorageScheme::File => Arc::new(LocalFileSystem::new()),
        StorageScheme::Memory => memory_bucket(uri.bucket()),
    };

    info!(storage = %uri, credentials = credentials.kind(), "opened staging storage");

    Ok(store)
}

/// In-memory buckets of this process, by name.
static MEMORY_BUCKETS: LazyLock<Mutex<HashMap<String, Arc<InMemory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns the in-memory bucket `name`, creating it on first use.
///
/// Every `memory://<name>` URI opened in the process sees the same objects, like a real bucket.
fn memory_bucket(name: &str) -> Arc<dyn ObjectStore> {
    let mut buckets = MEMORY_BUCKETS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    buckets
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(InMemory::new()))
        .clone()
}

fn build_error(err: object_store::Error) -> SyncError {
    sync_error!(
        ErrorKind::ConfigError,
        "Staging storage client could not be built",
        err.to_string(),
        source: err
    )
}

/// A staging location together with the store holding it.
///
/// All paths taken and returned are relative to [`StagingStore::root`].
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: StorageUri,
    store: Arc<dyn ObjectStore>,
}

impl StagingStore {
    pub fn new(root: StorageUri, store: Arc<dyn ObjectStore>) -> Self {
        Self { root, store }
    }

    /// Resolves credentials-free stores (`file`, `memory`) or uses `credentials` for cloud ones.
    pub fn open(root: StorageUri, credentials: &StorageCredentials) -> SyncResult<Self> {
        let store = open_object_store(&root, credentials)?;
        Ok(Self::new(root, store))
    }

    pub fn root(&self) -> &StorageUri {
        &self.root
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Same store, rooted at `segment` below the current root.
    pub fn at(&self, segment: &str) -> StagingStore {
        StagingStore {
            root: self.root.join(segment),
            store: self.store.clone(),
        }
    }

    pub async fn put(&self, relative: &str, data: Bytes) -> SyncResult<()> {
        let path = self.root.object_path(relative);
        let size = data.len();
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|err| SyncError::from(err).context(format!("put {path}")))?;

        debug!(%path, size, "staged object");

        Ok(())
    }

    pub async fn get(&self, relative: &str) -> SyncResult<Bytes> {
        let path = self.root.object_path(relative);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|err| SyncError::from(err).context(format!("get {path}")))?;

        Ok(result.bytes().await?)
    }

    /// Like [`StagingStore::get`] but a missing object is `None`.
    pub async fn get_opt(&self, relative: &str) -> SyncResult<Option<Bytes>> {
        let path = self.root.object_path(relative);
        match self.store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(SyncError::from(err).context(format!("get {path}"))),
        }
    }

    pub async fn delete(&self, relative: &str) -> SyncResult<()> {
        let path = self.root.object_path(relative);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(SyncError::from(err).context(format!("delete {path}"))),
        }
    }

    /// Lists every object below `relative_dir`, recursively, in lexical order of their paths.
    pub async fn list(&self, relative_dir: &str) -> SyncResult<Vec<String>> {
        let prefix = self.root.object_path(relative_dir);
        let listing = if prefix.as_ref().is_empty() {
            self.store.list(None)
        } else {
            self.store.list(Some(&prefix))
        };

        let objects: Vec<_> = listing
            .try_collect()
            .await
            .map_err(|err| SyncError::from(err).context(format!("list {prefix}")))?;

        let mut paths = Vec::with_capacity(objects.len());
        for meta in &objects {
            match self.root.relative_path(&meta.location) {
                Some(relative) => paths.push(relative.to_string()),
                None => bail!(
                    ErrorKind::InvalidState,
                    "Listed object lies outside the staging root",
                    format!("{} is not below {}", meta.location, self.root)
                ),
            }
        }
        paths.sort();

        Ok(paths)
    }

    /// Lists the objects directly under `relative_dir` whose file name starts with `name_prefix`.
    pub async fn list_with_name_prefix(
        &self,
        relative_dir: &str,
        name_prefix: &str,
    ) -> SyncResult<Vec<String>> {
        let dir = relative_dir.trim_matches('/');
        let paths = self.list(dir).await?;

        Ok(paths
            .into_iter()
            .filter(|path| {
                let name = if dir.is_empty() {
                    Some(path.as_str())
                } else {
                    path.strip_prefix(dir)
                        .and_then(|rest| rest.strip_prefix('/'))
                };
                name.is_some_and(|name| !name.contains('/') && name.starts_with(name_prefix))
            })
            .collect())
    }
}
