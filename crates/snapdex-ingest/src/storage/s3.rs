use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use snapdex_common::ImageIdentity;
use tracing::{debug, info, instrument};

use super::{config::S3Config, object_key, StorageLocation, StorageSink, IMAGE_CONTENT_TYPE};
use crate::error::StorageError;

const BACKEND: &str = "s3";

/// Images as objects in an S3-compatible bucket
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    pub fn new(config: S3Config) -> Self {
        debug!("Initializing S3 storage with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "snapdex-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(bucket = %config.bucket, prefix = ?config.prefix, "S3 storage client initialized");

        Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    /// Full object key, including the configured prefix
    pub fn key_for(&self, identity: &ImageIdentity) -> String {
        let key = object_key(identity);
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, key),
            _ => key,
        }
    }

    fn location_of(&self, key: &str) -> StorageLocation {
        StorageLocation::new(format!("s3://{}/{}", self.bucket, key))
    }
}

fn unavailable(reason: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable {
        backend: BACKEND,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl StorageSink for S3Storage {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| unavailable(format!("bucket {}: {}", self.bucket, e)))?;
        Ok(())
    }

    #[instrument(skip(self, identity, bytes), fields(identity = %identity.short(), size = bytes.len()))]
    async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError> {
        let key = self.key_for(identity);
        let location = self.location_of(&key);

        if self.exists(identity).await? {
            debug!(%location, "Image already present");
            return Ok(location);
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(IMAGE_CONTENT_TYPE)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| unavailable(format!("upload {}: {}", key, e)))?;

        debug!(%location, "Stored image");
        Ok(location)
    }

    async fn exists(&self, identity: &ImageIdentity) -> Result<bool, StorageError> {
        let key = self.key_for(identity);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(unavailable(format!("head {}: {}", key, e))),
        }
    }

    async fn get(&self, identity: &ImageIdentity) -> Result<Vec<u8>, StorageError> {
        let key = self.key_for(identity);
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(StorageError::NotFound(*identity))
            },
            Err(e) => return Err(unavailable(format!("download {}: {}", key, e))),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| unavailable(format!("read {}: {}", key, e)))?
            .into_bytes()
            .to_vec();

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(prefix: Option<&str>) -> S3Storage {
        let mut config = S3Config::for_minio("http://localhost:9000", "memories");
        config.prefix = prefix.map(str::to_string);
        S3Storage::new(config)
    }

    #[test]
    fn test_key_without_prefix() {
        let identity = ImageIdentity::of(b"hello world");
        assert_eq!(
            storage(None).key_for(&identity),
            format!("images/{}.jpg", identity.to_hex())
        );
    }

    #[test]
    fn test_key_with_prefix() {
        let identity = ImageIdentity::of(b"hello world");
        let s3 = storage(Some("/users/42/"));
        let key = s3.key_for(&identity);
        assert_eq!(key, format!("users/42/images/{}.jpg", identity.to_hex()));
        assert_eq!(
            s3.location_of(&key).as_str(),
            format!("s3://memories/users/42/images/{}.jpg", identity.to_hex())
        );
    }
}
