//! Ingestion configuration
//!
//! Everything is read from `SNAPDEX_*` environment variables (a `.env` file
//! is honoured), with the defaults below. The CLI may override the data
//! directory and storage backend.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::{
    RetryPolicy, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_MS,
    DEFAULT_RETRY_MAX_MS,
};
use crate::storage::S3Config;

// ============================================================================
// Defaults
// ============================================================================

/// Default root for the index, local storage and job records.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default number of downloads in flight per job.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Default job deadline in seconds (1 hour).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Which storage backend to write images to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackendKind {
    Local,
    S3(S3Config),
}

impl StorageBackendKind {
    /// Resolve a backend by name; `s3` reads its settings from `lookup`
    pub fn from_name(
        name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "local" | "" => Ok(StorageBackendKind::Local),
            "s3" => Ok(StorageBackendKind::S3(S3Config::from_lookup(lookup)?)),
            other => anyhow::bail!("Unknown storage backend '{}' (expected local or s3)", other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackendKind::Local => "local",
            StorageBackendKind::S3(_) => "s3",
        }
    }
}

/// Knobs the orchestrator needs for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Downloads in flight at once
    pub fetch_concurrency: usize,
    /// Entries being reconstructed, deduplicated and stored at once
    pub process_concurrency: usize,
    /// Per-attempt fetch timeout
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    /// Deadline for the whole run
    pub job_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            process_concurrency: default_process_concurrency(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            job_timeout: Some(Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS)),
        }
    }
}

fn default_process_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Full ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub process_concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_max_attempts: u32,
    pub fetch_retry_base_ms: u64,
    pub fetch_retry_max_ms: u64,
    /// 0 disables the job deadline
    pub job_timeout_secs: u64,
    pub storage: StorageBackendKind,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            process_concurrency: default_process_concurrency(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fetch_max_attempts: DEFAULT_MAX_ATTEMPTS,
            fetch_retry_base_ms: DEFAULT_RETRY_BASE_MS,
            fetch_retry_max_ms: DEFAULT_RETRY_MAX_MS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            storage: StorageBackendKind::Local,
        }
    }
}

impl IngestConfig {
    /// Load from the environment (after reading `.env` if present)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            data_dir: lookup("SNAPDEX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            fetch_concurrency: parse_var(&lookup, "SNAPDEX_FETCH_CONCURRENCY")?
                .unwrap_or(defaults.fetch_concurrency),
            process_concurrency: parse_var(&lookup, "SNAPDEX_PROCESS_CONCURRENCY")?
                .unwrap_or(defaults.process_concurrency),
            fetch_timeout_secs: parse_var(&lookup, "SNAPDEX_FETCH_TIMEOUT_SECS")?
                .unwrap_or(defaults.fetch_timeout_secs),
            fetch_max_attempts: parse_var(&lookup, "SNAPDEX_FETCH_MAX_ATTEMPTS")?
                .unwrap_or(defaults.fetch_max_attempts),
            fetch_retry_base_ms: parse_var(&lookup, "SNAPDEX_FETCH_RETRY_BASE_MS")?
                .unwrap_or(defaults.fetch_retry_base_ms),
            fetch_retry_max_ms: parse_var(&lookup, "SNAPDEX_FETCH_RETRY_MAX_MS")?
                .unwrap_or(defaults.fetch_retry_max_ms),
            job_timeout_secs: parse_var(&lookup, "SNAPDEX_JOB_TIMEOUT_SECS")?
                .unwrap_or(defaults.job_timeout_secs),
            storage: match lookup("SNAPDEX_STORAGE_BACKEND") {
                Some(name) => StorageBackendKind::from_name(&name, &lookup)?,
                None => defaults.storage,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch_concurrency == 0 {
            anyhow::bail!("SNAPDEX_FETCH_CONCURRENCY must be greater than 0");
        }
        if self.process_concurrency == 0 {
            anyhow::bail!("SNAPDEX_PROCESS_CONCURRENCY must be greater than 0");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("SNAPDEX_FETCH_TIMEOUT_SECS must be greater than 0");
        }
        if self.fetch_max_attempts == 0 {
            anyhow::bail!("SNAPDEX_FETCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.fetch_retry_base_ms > self.fetch_retry_max_ms {
            anyhow::bail!(
                "SNAPDEX_FETCH_RETRY_BASE_MS ({}) cannot exceed SNAPDEX_FETCH_RETRY_MAX_MS ({})",
                self.fetch_retry_base_ms,
                self.fetch_retry_max_ms
            );
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageBackendKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn local_storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            fetch_concurrency: self.fetch_concurrency,
            process_concurrency: self.process_concurrency,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.fetch_max_attempts,
                base_delay: Duration::from_millis(self.fetch_retry_base_ms),
                max_delay: Duration::from_millis(self.fetch_retry_max_ms),
            },
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: '{}'", key, raw))
        })
        .transpose()
}
