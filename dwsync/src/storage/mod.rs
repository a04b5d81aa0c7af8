//! Staging storage: URI resolution, credentials and object access.

mod credentials;
mod store;
mod uri;

pub use credentials::{StorageCredentials, resolve_credentials, resolve_credentials_with};
pub use store::{StagingStore, open_object_store};
pub use uri::{INCREMENT_SUBPATH, SNAPSHOT_SUBPATH, StorageScheme, StorageUri, derive_paths};
