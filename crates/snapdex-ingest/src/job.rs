//! Ingestion job state
//!
//! An [`IngestJob`] is the unit of work for one manifest run. It moves through
//! the [`JobState`] machine and carries counts plus per-entry failures.
//! [`JobHandle`] is the shared, observable view the orchestrator updates
//! while the run is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snapdex_common::Result as CommonResult;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::IngestError;
use crate::manifest::{render_manifest, EntryKey, ManifestEntry};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Parsing,
    Fetching,
    Processing,
    Storing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Parsing => "parsing",
            JobState::Fetching => "fetching",
            JobState::Processing => "processing",
            JobState::Storing => "storing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Parsing => 1,
            JobState::Fetching => 2,
            JobState::Processing => 3,
            JobState::Storing => 4,
            JobState::Completed | JobState::Failed => 5,
        }
    }

    /// Forward moves only; `Failed` is reachable from any live state
    pub fn can_transition_to(&self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an entry failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStage {
    Parse,
    Fetch,
    Reconstruct,
    Store,
    Index,
    /// Never started: the job was cancelled, timed out or aborted first
    Scheduling,
}

impl EntryStage {
    pub fn as_str(&self) -> &str {
        match self {
            EntryStage::Parse => "parse",
            EntryStage::Fetch => "fetch",
            EntryStage::Reconstruct => "reconstruct",
            EntryStage::Store => "store",
            EntryStage::Index => "index",
            EntryStage::Scheduling => "scheduling",
        }
    }
}

impl fmt::Display for EntryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one entry did not make it into the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub key: EntryKey,
    pub source_ref: Option<String>,
    pub stage: EntryStage,
    pub reason: String,
    /// Re-running the entry later may succeed
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<ManifestEntry>,
}

impl EntryFailure {
    pub fn for_entry(
        entry: &ManifestEntry,
        stage: EntryStage,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            key: entry.key,
            source_ref: Some(entry.source_ref.to_string()),
            stage,
            reason: reason.into(),
            retryable,
            entry: Some(entry.clone()),
        }
    }
}

/// Per-job counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Records in the manifest
    pub total: usize,
    pub fetched: usize,
    pub reconstructed: usize,
    /// Entries whose image was already indexed
    pub duplicate: usize,
    /// Entries whose image was newly stored
    pub stored: usize,
    pub failed: usize,
    /// Non-photo entries
    pub skipped: usize,
}

impl JobCounts {
    /// Entries with a final outcome
    pub fn resolved(&self) -> usize {
        self.stored + self.duplicate + self.failed + self.skipped
    }
}

/// One manifest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub job_id: Uuid,
    pub state: JobState,
    pub counts: JobCounts,
    pub errors: Vec<EntryFailure>,
    /// Reason the job ended `Failed`
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for IngestJob {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestJob {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            state: JobState::Pending,
            counts: JobCounts::default(),
            errors: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), IngestError> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Move to `Failed` with a reason; a no-op once terminal
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Failed;
        self.failure = Some(reason.into());
        self.touch();
    }

    pub fn record_failure(&mut self, failure: EntryFailure) {
        self.counts.failed += 1;
        self.errors.push(failure);
        self.touch();
    }

    /// Manifest document holding only the failed entries worth retrying
    pub fn retry_manifest(&self) -> Option<Value> {
        let mut entries: Vec<&ManifestEntry> = self
            .errors
            .iter()
            .filter(|f| f.retryable)
            .filter_map(|f| f.entry.as_ref())
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by_key(|e| e.key);
        Some(render_manifest(entries))
    }

    /// Write the job record to `<dir>/<job_id>.json`, replacing it atomically
    pub fn save(&self, dir: &Path) -> CommonResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.job_id));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(path)
    }

    pub fn load(path: &Path) -> CommonResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Shared, observable handle on a running job
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: Uuid,
    job: Arc<RwLock<IngestJob>>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn new(job: IngestJob) -> Self {
        Self {
            job_id: job.job_id,
            job: Arc::new(RwLock::new(job)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Point-in-time copy of the job
    pub fn snapshot(&self) -> IngestJob {
        self.job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> JobState {
        self.job.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn counts(&self) -> JobCounts {
        self.job.read().unwrap_or_else(PoisonError::into_inner).counts
    }

    /// Request cancellation. Entries not yet started are not started;
    /// in-flight entries finish their current step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut IngestJob) -> R) -> R {
        let mut job = self.job.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut job)
    }
}

/// Jobs known to this process, by id
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: JobHandle) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.job_id(), handle);
    }

    pub fn get(&self, job_id: &Uuid) -> Option<JobHandle> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<IngestJob> {
        let mut jobs: Vec<IngestJob> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(JobHandle::snapshot)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}
