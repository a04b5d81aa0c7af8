use std::fmt;

use object_store::path::Path as ObjectPath;
use url::Url;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Sub-path receiving snapshot shards.
pub const SNAPSHOT_SUBPATH: &str = "snapshot";

/// Sub-path receiving change batches written by the CDC service.
pub const INCREMENT_SUBPATH: &str = "increment";

/// Object storage provider addressed by a [`StorageUri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    S3,
    Gcs,
    File,
    Memory,
}

impl StorageScheme {
    fn canonical(&self) -> &'static str {
        match self {
            StorageScheme::S3 => "s3",
            StorageScheme::Gcs => "gs",
            StorageScheme::File => "file",
            StorageScheme::Memory => "memory",
        }
    }
}

/// Parsed staging location: provider, bucket and key prefix.
///
/// Query parameters (`region`, `endpoint`) are kept as connection hints and never rendered,
/// so a [`StorageUri`] can be logged and handed to warehouses as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    scheme: StorageScheme,
    bucket: String,
    prefix: String,
    region: Option<String>,
    endpoint: Option<String>,
}

impl StorageUri {
    /// Parses `s3://`, `gs://` (or `gcs://`), `file://` and `memory://` URIs.
    pub fn parse(uri: &str) -> SyncResult<Self> {
        let url = match Url::parse(uri.trim()) {
            Ok(url) => url,
            Err(err) => bail!(
                ErrorKind::InvalidStorageUri,
                "Storage URI could not be parsed",
                format!("`{uri}`: {err}"),
                source: err
            ),
        };

        let scheme = match url.scheme() {
            "s3" | "s3a" => StorageScheme::S3,
            "gs" | "gcs" => StorageScheme::Gcs,
            "file" | "local" => StorageScheme::File,
            "memory" => StorageScheme::Memory,
            other => bail!(
                ErrorKind::InvalidStorageUri,
                "Unsupported storage URI scheme",
                format!("`{other}` in `{uri}`, expected one of s3, gs, file, memory")
            ),
        };

        let bucket = url.host_str().unwrap_or_default().to_string();
        if matches!(scheme, StorageScheme::S3 | StorageScheme::Gcs) && bucket.is_empty() {
            bail!(
                ErrorKind::InvalidStorageUri,
                "Storage URI has no bucket",
                uri
            );
        }

        let mut region = None;
        let mut endpoint = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "region" => region = Some(value.into_owned()),
                "endpoint" => endpoint = Some(value.into_owned()),
                _ => {}
            }
        }

        let prefix = match scheme {
            // Local paths are absolute; the bucket slot of a file URI is the host, which is empty.
            StorageScheme::File => url.path().trim_end_matches('/').to_string(),
            _ => url.path().trim_matches('/').to_string(),
        };

        Ok(Self {
            scheme,
            bucket,
            prefix,
            region,
            endpoint,
        })
    }

    pub fn scheme(&self) -> StorageScheme {
        self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key prefix inside the bucket, without leading or trailing slashes.
    pub fn prefix(&self) -> &str {
        self.prefix.trim_start_matches('/')
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Overrides the region hint, e.g. from configuration.
    pub fn with_region(mut self, region: Option<String>) -> Self {
        if region.is_some() {
            self.region = region;
        }
        self
    }

    /// Overrides the endpoint hint, e.g. from configuration.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        if endpoint.is_some() {
            self.endpoint = endpoint;
        }
        self
    }

    /// Returns a URI pointing at `segment` below this one.
    pub fn join(&self, segment: &str) -> StorageUri {
        let segment = segment.trim_matches('/');
        let mut joined = self.clone();
        if segment.is_empty() {
            return joined;
        }

        joined.prefix = if self.prefix.is_empty() {
            match self.scheme {
                StorageScheme::File => format!("/{segment}"),
                _ => segment.to_string(),
            }
        } else {
            format!("{}/{segment}", self.prefix)
        };
        joined
    }

    /// Key of `relative` inside the bucket.
    pub fn object_path(&self, relative: &str) -> ObjectPath {
        let relative = relative.trim_matches('/');
        match (self.prefix().is_empty(), relative.is_empty()) {
            (true, _) => ObjectPath::from(relative),
            (false, true) => ObjectPath::from(self.prefix()),
            (false, false) => ObjectPath::from(format!("{}/{relative}", self.prefix())),
        }
    }

    /// Key of `path` relative to this URI's prefix, if `path` lies below it.
    pub fn relative_path<'a>(&self, path: &'a ObjectPath) -> Option<&'a str> {
        let path = path.as_ref();
        if self.prefix().is_empty() {
            return Some(path);
        }

        path.strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Full URI of `relative`, as understood by warehouses loading from this location.
    pub fn url_for(&self, relative: &str) -> String {
        self.join(relative).to_string()
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            StorageScheme::File => write!(f, "file://{}", self.prefix),
            _ if self.prefix.is_empty() => {
                write!(f, "{}://{}", self.scheme.canonical(), self.bucket)
            }
            _ => write!(
                f,
                "{}://{}/{}",
                self.scheme.canonical(),
                self.bucket,
                self.prefix
            ),
        }
    }
}

/// Splits a staging root into its snapshot and incremental locations.
pub fn derive_paths(root: &StorageUri) -> (StorageUri, StorageUri) {
    (root.join(SNAPSHOT_SUBPATH), root.join(INCREMENT_SUBPATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_snapshot_and_increment_locations() {
        let root = StorageUri::parse("s3://bucket/prefix").unwrap();
        let (snapshot, increment) = derive_paths(&root);

        assert_eq!(snapshot.to_string(), "s3://bucket/prefix/snapshot");
        assert_eq!(increment.to_string(), "s3://bucket/prefix/increment");
        assert_eq!(snapshot.bucket(), "bucket");
        assert_eq!(increment.prefix(), "prefix/increment");
    }

    #[test]
    fn trailing_slash_and_bucket_root_are_normalized() {
        let (snapshot, _) = derive_paths(&StorageUri::parse("gs://bucket/dw/").unwrap());
        assert_eq!(snapshot.to_string(), "gs://bucket/dw/snapshot");

        let (snapshot, _) = derive_paths(&StorageUri::parse("gcs://bucket").unwrap());
        assert_eq!(snapshot.to_string(), "gs://bucket/snapshot");
        assert_eq!(snapshot.scheme(), StorageScheme::Gcs);
    }

    #[test]
    fn query_parameters_become_hints_and_are_not_rendered() {
        let uri =
            StorageUri::parse("s3://bucket/p?region=eu-west-1&endpoint=http://minio:9000").unwrap();

        assert_eq!(uri.region(), Some("eu-west-1"));
        assert_eq!(uri.endpoint(), Some("http://minio:9000"));
        assert_eq!(uri.to_string(), "s3://bucket/p");
    }

    #[test]
    fn invalid_uris_are_rejected() {
        for uri in ["not a uri", "ftp://host/path", "s3:///no-bucket", ""] {
            let err = StorageUri::parse(uri).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidStorageUri, "{uri}");
        }
    }

    #[test]
    fn local_paths_stay_absolute() {
        let uri = StorageUri::parse("file:///tmp/dwsync").unwrap();
        let (snapshot, _) = derive_paths(&uri);

        assert_eq!(snapshot.to_string(), "file:///tmp/dwsync/snapshot");
        assert_eq!(
            snapshot.object_path("db1.orders.000000.csv").as_ref(),
            "tmp/dwsync/snapshot/db1.orders.000000.csv"
        );
    }

    #[test]
    fn object_paths_are_relative_to_the_bucket() {
        let increment = StorageUri::parse("s3://bucket/root/increment").unwrap();
        let path = increment.object_path("db1/orders/1/CDC000001.csv");

        assert_eq!(path.as_ref(), "root/increment/db1/orders/1/CDC000001.csv");
        assert_eq!(
            increment.relative_path(&path),
            Some("db1/orders/1/CDC000001.csv")
        );
        assert_eq!(
            increment.url_for("db1/orders/1/CDC000001.csv"),
            "s3://bucket/root/increment/db1/orders/1/CDC000001.csv"
        );
    }
}
