use async_trait::async_trait;
use snapdex_common::ImageIdentity;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use url::Url;

use super::{object_key, StorageLocation, StorageSink};
use crate::error::StorageError;

const BACKEND: &str = "local";

/// Images as files under a root directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, identity: &ImageIdentity) -> PathBuf {
        self.root.join(object_key(identity))
    }

    fn location_of(&self, path: &Path) -> StorageLocation {
        match Url::from_file_path(path) {
            Ok(url) => StorageLocation::new(url.to_string()),
            Err(()) => StorageLocation::new(format!("file://{}", path.display())),
        }
    }
}

fn unavailable(reason: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable {
        backend: BACKEND,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl StorageSink for LocalStorage {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        let dir = self.root.join("images");
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            // A write probe catches read-only mounts and permission problems
            let probe = tempfile::NamedTempFile::new_in(&dir)?;
            probe.close()
        })
        .await
        .map_err(unavailable)?
        .map_err(|e| unavailable(format!("{}: {}", self.root.display(), e)))
    }

    #[instrument(skip(self, identity, bytes), fields(identity = %identity.short(), size = bytes.len()))]
    async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError> {
        let path = self.path_of(identity);
        let location = self.location_of(&path);

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            if target.exists() {
                return Ok(false);
            }
            let dir = target
                .parent()
                .ok_or_else(|| std::io::Error::other("object path has no parent"))?;
            std::fs::create_dir_all(dir)?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(true)
        })
        .await
        .map_err(unavailable)?
        .map_err(|e| unavailable(format!("{}: {}", path.display(), e)))?;

        if written {
            debug!(path = %path.display(), "Stored image");
        } else {
            debug!(path = %path.display(), "Image already present");
        }

        Ok(location)
    }

    async fn exists(&self, identity: &ImageIdentity) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.path_of(identity))
            .await
            .map_err(unavailable)
    }

    async fn get(&self, identity: &ImageIdentity) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_of(identity)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(*identity))
            },
            Err(e) => Err(unavailable(e)),
        }
    }
}
