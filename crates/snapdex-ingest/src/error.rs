//! Error types for the ingestion core
//!
//! Entry-scoped errors ([`FetchError`], [`UnsupportedAsset`]) end up on the
//! job's error list. Systemic errors ([`IngestError::MalformedManifest`],
//! [`IngestError::StorageUnavailable`], [`IngestError::IndexUnavailable`])
//! move the job to `FAILED`.

use snapdex_common::ImageIdentity;
use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobState;

/// Failure to retrieve one entry's bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u32, reason: String },

    /// The reference can never succeed (not found, forbidden, bad URL)
    #[error("{reason}")]
    Terminal { status: Option<u16>, reason: String },

    #[error("cancelled before the fetch started")]
    Cancelled,

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

impl FetchError {
    /// Whether re-running just this entry later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Terminal { .. })
    }
}

/// A payload that cannot be flattened into exactly one image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported asset: {reason}")]
pub struct UnsupportedAsset {
    pub reason: String,
}

impl UnsupportedAsset {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Storage sink failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{backend} storage unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("image {0} not found in storage")]
    NotFound(ImageIdentity),
}

/// Master index persistence failures
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index journal corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("index lock poisoned")]
    Poisoned,

    #[error("index task failed: {0}")]
    Task(String),
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Top-level ingestion error taxonomy
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("fetch failed: {0}")]
    EntryFetchFailure(#[from] FetchError),

    #[error(transparent)]
    UnsupportedAsset(#[from] UnsupportedAsset),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("master index unavailable: {0}")]
    IndexUnavailable(#[from] IndexError),

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },
}

impl IngestError {
    /// Systemic errors end the whole job; the rest are recorded per entry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedManifest(_)
                | IngestError::StorageUnavailable(_)
                | IngestError::IndexUnavailable(_)
                | IngestError::Cancelled
        )
    }
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        IngestError::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryability() {
        let terminal = FetchError::Terminal {
            status: Some(404),
            reason: "HTTP 404 Not Found".to_string(),
        };
        assert!(!terminal.is_retryable());
        assert!(FetchError::Exhausted {
            attempts: 3,
            reason: "timed out".to_string()
        }
        .is_retryable());
        assert!(FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_entry_errors_are_not_fatal() {
        assert!(!IngestError::from(UnsupportedAsset::new("empty archive")).is_fatal());
        assert!(!IngestError::from(FetchError::Cancelled).is_fatal());
        assert!(IngestError::MalformedManifest("not json".into()).is_fatal());
        assert!(IngestError::from(StorageError::Unavailable {
            backend: "s3",
            reason: "connection refused".into(),
        })
        .is_fatal());
    }
}
