//! Content-addressed image storage
//!
//! A [`StorageSink`] persists canonical image bytes under a key derived only
//! from the image identity (`images/<hex>.jpg`), so the same image always
//! lands at the same place and a repeated `put` is harmless.
//!
//! Two backends ship: [`LocalStorage`] for a directory on disk and
//! [`S3Storage`] for any S3-compatible object store. [`StorageBackend`]
//! selects one from configuration.

pub mod config;
mod local;
mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapdex_common::ImageIdentity;
use std::fmt;

use crate::config::{IngestConfig, StorageBackendKind};
use crate::error::StorageError;

pub use config::S3Config;
pub use local::LocalStorage;
pub use s3::S3Storage;

/// Content type of every stored object
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Relative object key for an identity
pub fn object_key(identity: &ImageIdentity) -> String {
    format!("images/{}.jpg", identity.to_hex())
}

/// Where a stored image can be read back from (`file://...` or `s3://...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageLocation(String);

impl StorageLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable home for canonical images
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Short backend name for logs and errors
    fn backend_name(&self) -> &'static str;

    /// Check the backend is reachable and writable before work starts
    async fn ensure_ready(&self) -> Result<(), StorageError>;

    /// Persist `bytes` under the identity's key. Storing the same identity
    /// again returns the same location.
    async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError>;

    async fn exists(&self, identity: &ImageIdentity) -> Result<bool, StorageError>;

    async fn get(&self, identity: &ImageIdentity) -> Result<Vec<u8>, StorageError>;
}

/// Backend chosen at startup
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local(LocalStorage),
    S3(S3Storage),
}

impl StorageBackend {
    pub fn from_config(config: &IngestConfig) -> Self {
        match config.storage {
            StorageBackendKind::Local => {
                StorageBackend::Local(LocalStorage::new(config.local_storage_dir()))
            },
            StorageBackendKind::S3(ref s3) => StorageBackend::S3(S3Storage::new(s3.clone())),
        }
    }

    fn inner(&self) -> &dyn StorageSink {
        match self {
            StorageBackend::Local(local) => local,
            StorageBackend::S3(s3) => s3,
        }
    }
}

#[async_trait]
impl StorageSink for StorageBackend {
    fn backend_name(&self) -> &'static str {
        self.inner().backend_name()
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        self.inner().ensure_ready().await
    }

    async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError> {
        self.inner().put(identity, bytes).await
    }

    async fn exists(&self, identity: &ImageIdentity) -> Result<bool, StorageError> {
        self.inner().exists(identity).await
    }

    async fn get(&self, identity: &ImageIdentity) -> Result<Vec<u8>, StorageError> {
        self.inner().get(identity).await
    }
}
