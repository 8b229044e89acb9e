//! Content fetching
//!
//! Downloads the raw bytes behind an entry's source reference with a
//! per-attempt timeout and bounded retry. Failures are classified so the job
//! can tell "try again later" (timeouts, 5xx, throttling) from "will never
//! work" (not found, forbidden, bad reference).

use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::manifest::{EntryKey, ManifestEntry};

/// Default per-attempt timeout (seconds)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default attempts per entry, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry (milliseconds)
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default ceiling on the retry delay (milliseconds)
pub const DEFAULT_RETRY_MAX_MS: u64 = 8_000;

/// Local-file-header signature that opens every ZIP archive
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// What the fetched bytes look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A single encoded image
    Image,
    /// A ZIP bundle of layers
    Archive,
}

impl PayloadKind {
    /// Sniff the payload: ZIP magic bytes or a zip content type mean archive
    pub fn detect(bytes: &[u8], content_type: Option<&str>) -> Self {
        let zip_type = content_type
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.starts_with("application/zip") || ct.starts_with("application/x-zip")
            })
            .unwrap_or(false);

        if bytes.starts_with(ZIP_MAGIC) || zip_type {
            PayloadKind::Archive
        } else {
            PayloadKind::Image
        }
    }
}

/// Raw bytes for one entry
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub key: EntryKey,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub kind: PayloadKind,
    /// Attempts it took, including the successful one
    pub attempts: u32,
}

/// Outcome of one HTTP attempt
enum AttemptError {
    Retryable(String),
    Terminal { status: Option<u16>, reason: String },
}

/// HTTP downloader shared by all fetch tasks of a job
#[derive(Debug, Clone)]
pub struct ContentFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl ContentFetcher {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("snapdex-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch an entry's bytes.
    ///
    /// Cancellation is checked before every attempt and while backing off; an
    /// attempt already on the wire runs to completion or timeout.
    pub async fn fetch(
        &self,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> Result<FetchedPayload, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            debug!(entry = %entry.key, attempt, max_attempts, "Fetching");

            match self.attempt(entry).await {
                Ok((bytes, content_type)) => {
                    let kind = PayloadKind::detect(&bytes, content_type.as_deref());
                    debug!(
                        entry = %entry.key,
                        bytes = bytes.len(),
                        ?kind,
                        "Fetched payload"
                    );
                    return Ok(FetchedPayload {
                        key: entry.key,
                        bytes,
                        content_type,
                        kind,
                        attempts: attempt,
                    });
                },
                Err(AttemptError::Terminal { status, reason }) => {
                    warn!(entry = %entry.key, %reason, "Fetch failed permanently");
                    return Err(FetchError::Terminal { status, reason });
                },
                Err(AttemptError::Retryable(reason)) => {
                    last_reason = reason;
                    if attempt < max_attempts {
                        let delay = self.policy.delay_after(attempt);
                        warn!(
                            entry = %entry.key,
                            attempt,
                            max_attempts,
                            reason = %last_reason,
                            delay_ms = delay.as_millis() as u64,
                            "Fetch attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {},
                        }
                    }
                },
            }
        }

        warn!(entry = %entry.key, attempts = max_attempts, reason = %last_reason, "Fetch retries exhausted");
        Err(FetchError::Exhausted {
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt(
        &self,
        entry: &ManifestEntry,
    ) -> Result<(Vec<u8>, Option<String>), AttemptError> {
        let response = self
            .client
            .get(entry.source_ref.clone())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {}", status);
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(reason)
            } else {
                AttemptError::Terminal {
                    status: Some(status.as_u16()),
                    reason,
                }
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(classify_transport)?;
        Ok((bytes.to_vec(), content_type))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_transport(err: reqwest::Error) -> AttemptError {
    if err.is_builder() {
        return AttemptError::Terminal {
            status: None,
            reason: format!("invalid request: {}", err),
        };
    }
    let reason = if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    };
    AttemptError::Retryable(reason)
}
