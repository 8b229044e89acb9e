use serde::{Deserialize, Serialize};
use snapdex_common::{Result, SnapdexError};
use std::env;

/// Default S3 region
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Connection settings for the S3 backend
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Key prefix prepended to every object key
    pub prefix: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl S3Config {
    /// Read `S3_*` variables (falling back to `AWS_*` credentials).
    ///
    /// `S3_BUCKET` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bucket = var("S3_BUCKET")
            .ok_or_else(|| SnapdexError::Config("S3_BUCKET must be set for the s3 backend".into()))?;

        Ok(Self {
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            bucket,
            prefix: var("S3_PREFIX"),
            access_key: var("S3_ACCESS_KEY")
                .or_else(|| var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default(),
            secret_key: var("S3_SECRET_KEY")
                .or_else(|| var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            path_style: var("S3_PATH_STYLE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    /// Settings for a local MinIO instance with its stock credentials
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            prefix: None,
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = S3Config::for_minio("http://localhost:9000", "memories");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "memories");
        assert!(config.path_style);
        assert_eq!(config.prefix, None);
    }

    #[test]
    fn test_from_lookup() {
        let vars = |key: &str| match key {
            "S3_BUCKET" => Some("memories".to_string()),
            "S3_PREFIX" => Some("".to_string()),
            "AWS_ACCESS_KEY_ID" => Some("AKIA".to_string()),
            "S3_PATH_STYLE" => Some("true".to_string()),
            _ => None,
        };
        let config = S3Config::from_lookup(vars).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.bucket, "memories");
        assert_eq!(config.region, DEFAULT_S3_REGION);
        assert_eq!(config.prefix, None);
        assert_eq!(config.access_key, "AKIA");
        assert!(config.path_style);
    }

    #[test]
    fn test_bucket_is_required() {
        let err = S3Config::from_lookup(|_| None).err();
        assert!(matches!(err, Some(SnapdexError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = S3Config::for_minio("http://localhost:9000", "memories").with_prefix("snapdex");
        let printed = format!("{:?}", config);
        assert_eq!(printed.matches("minioadmin").count(), 1);
        assert!(printed.contains("<redacted>"));
        assert!(printed.contains("snapdex"));
    }
}
