// Ingestion job orchestrator
//
// Drives one manifest through parse → fetch → reconstruct → dedup → store →
// index. Fetching and processing are two buffer_unordered stages chained on
// one stream: up to `fetch_concurrency` downloads are in flight while up to
// `process_concurrency` fetched entries are being reconstructed and stored.
// Entry-level failures are recorded on the job; storage or index outages
// abort the run.

use futures::stream::{self, StreamExt};
use snapdex_common::ImageIdentity;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::dedup::{Admission, Deduplicator};
use crate::error::{FetchError, IndexError, IngestError};
use crate::fetch::{ContentFetcher, FetchedPayload};
use crate::index::{MasterIndex, Occurrence};
use crate::job::{EntryFailure, EntryStage, IngestJob, JobHandle, JobRegistry, JobState};
use crate::manifest::{EntryKey, ManifestEntry, ManifestParser};
use crate::reconstruct::AssetReconstructor;
use crate::storage::StorageSink;

/// Final result for one manifest entry
enum EntryOutcome {
    Stored,
    Duplicate,
    Failed(EntryFailure),
}

/// Shared state of one run's pipeline
struct RunContext<'a> {
    handle: &'a JobHandle,
    /// Cancelled by the job's own token or by a systemic failure
    abort: CancellationToken,
    systemic: Mutex<Option<String>>,
    /// Entries that reached the store step; their index write may outlive
    /// the job deadline
    writing: Mutex<HashSet<EntryKey>>,
}

impl RunContext<'_> {
    /// Record the first systemic failure and stop starting new work
    fn abort_with(&self, err: &IngestError) {
        let mut systemic = self.systemic.lock().unwrap_or_else(PoisonError::into_inner);
        if systemic.is_none() {
            error!(error = %err, "Aborting job");
            *systemic = Some(err.to_string());
        }
        self.abort.cancel();
    }

    fn systemic_failure(&self) -> Option<String> {
        self.systemic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_writing(&self, key: EntryKey) {
        self.writing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    /// Why an unresolved entry failed when the deadline fired
    fn deadline_reason(&self, key: &EntryKey) -> &'static str {
        if self
            .writing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
        {
            "timed out while writing; the image may already be stored and indexed"
        } else {
            "timed out"
        }
    }

    /// Why an entry was not started
    fn not_started_reason(&self) -> String {
        match self.systemic_failure() {
            Some(reason) => format!("aborted: {}", reason),
            None => "cancelled".to_string(),
        }
    }
}

/// Runs ingestion jobs against one index and one storage sink
pub struct JobOrchestrator<S: StorageSink> {
    config: PipelineConfig,
    parser: ManifestParser,
    fetcher: ContentFetcher,
    reconstructor: AssetReconstructor,
    dedup: Arc<Deduplicator>,
    sink: Arc<S>,
    registry: Arc<JobRegistry>,
}

impl<S: StorageSink> Clone for JobOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            parser: self.parser.clone(),
            fetcher: self.fetcher.clone(),
            reconstructor: self.reconstructor,
            dedup: Arc::clone(&self.dedup),
            sink: Arc::clone(&self.sink),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: StorageSink> JobOrchestrator<S> {
    pub fn new(
        config: PipelineConfig,
        index: Arc<MasterIndex>,
        sink: Arc<S>,
    ) -> Result<Self, IngestError> {
        let fetcher = ContentFetcher::new(config.fetch_timeout, config.retry)?;
        Ok(Self::with_fetcher(config, index, sink, fetcher))
    }

    /// Use a preconfigured fetcher (custom HTTP client)
    pub fn with_fetcher(
        config: PipelineConfig,
        index: Arc<MasterIndex>,
        sink: Arc<S>,
        fetcher: ContentFetcher,
    ) -> Self {
        Self {
            config,
            parser: ManifestParser::new(),
            fetcher,
            reconstructor: AssetReconstructor::new(),
            dedup: Arc::new(Deduplicator::new(index)),
            sink,
            registry: Arc::new(JobRegistry::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<MasterIndex> {
        self.dedup.index()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Create and register a `Pending` job
    pub fn create_job(&self) -> JobHandle {
        let handle = JobHandle::new(IngestJob::new());
        self.registry.insert(handle.clone());
        handle
    }

    /// Create a job and run it to a terminal state
    pub async fn run(&self, manifest: &str) -> IngestJob {
        let handle = self.create_job();
        self.execute(&handle, manifest).await
    }

    /// Run a `Pending` job to a terminal state and return its final record.
    ///
    /// Per-entry failures never fail the job. A malformed manifest, an
    /// unavailable storage backend or index, or cancellation does.
    pub async fn execute(&self, handle: &JobHandle, manifest: &str) -> IngestJob {
        let span = info_span!("job", job_id = %handle.job_id());
        async {
            let start = Instant::now();
            if let Err(e) = self.drive(handle, manifest).await {
                handle.update(|job| job.fail(e.to_string()));
            }

            let job = handle.snapshot();
            let c = job.counts;
            info!(
                state = %job.state,
                total = c.total,
                stored = c.stored,
                duplicate = c.duplicate,
                failed = c.failed,
                skipped = c.skipped,
                duration_secs = start.elapsed().as_secs_f64(),
                "Job finished"
            );
            job
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, handle: &JobHandle, manifest: &str) -> Result<(), IngestError> {
        advance(handle, JobState::Parsing)?;

        let parsed = self.parser.parse(manifest)?;
        let photos: Vec<ManifestEntry> = parsed.photos().cloned().collect();
        handle.update(|job| {
            job.counts.total = parsed.total_records;
            job.counts.skipped = parsed.video_count();
            for failure in &parsed.failures {
                job.record_failure(EntryFailure {
                    key: failure.key,
                    source_ref: failure.source_ref.clone(),
                    stage: EntryStage::Parse,
                    reason: failure.reason.clone(),
                    retryable: false,
                    entry: None,
                });
            }
        });

        if handle.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        self.sink.ensure_ready().await?;

        advance(handle, JobState::Fetching)?;
        info!(
            photos = photos.len(),
            fetch_concurrency = self.config.fetch_concurrency,
            process_concurrency = self.config.process_concurrency,
            backend = self.sink.backend_name(),
            "Fetching"
        );

        let ctx = RunContext {
            handle,
            abort: handle.cancellation_token().child_token(),
            systemic: Mutex::new(None),
            writing: Mutex::new(HashSet::new()),
        };

        let mut resolved: HashSet<EntryKey> = HashSet::with_capacity(photos.len());
        let pipeline = self.run_pipeline(&photos, &ctx, &mut resolved);

        let timed_out = match self.config.job_timeout {
            Some(limit) => tokio::time::timeout(limit, pipeline).await.is_err(),
            None => {
                pipeline.await;
                false
            },
        };

        if let Some(reason) = ctx.systemic_failure() {
            handle.update(|job| job.fail(reason));
            return Ok(());
        }
        if handle.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        if timed_out {
            let unresolved: Vec<&ManifestEntry> = photos
                .iter()
                .filter(|e| !resolved.contains(&e.key))
                .collect();
            warn!(unresolved = unresolved.len(), "Job deadline reached");
            handle.update(|job| {
                for entry in unresolved {
                    job.record_failure(EntryFailure::for_entry(
                        entry,
                        EntryStage::Scheduling,
                        ctx.deadline_reason(&entry.key),
                        true,
                    ));
                }
            });
        }

        advance(handle, JobState::Processing)?;
        advance(handle, JobState::Storing)?;

        let index = Arc::clone(self.dedup.index());
        tokio::task::spawn_blocking(move || index.checkpoint())
            .await
            .map_err(|e| IndexError::Task(e.to_string()))??;

        let counts = handle.counts();
        if counts.resolved() != counts.total {
            warn!(
                resolved = counts.resolved(),
                total = counts.total,
                "Entry outcomes do not add up to the manifest size"
            );
        }

        advance(handle, JobState::Completed)?;
        Ok(())
    }

    /// Push every photo entry through fetch and processing, recording each
    /// outcome on the job as it resolves
    async fn run_pipeline(
        &self,
        photos: &[ManifestEntry],
        ctx: &RunContext<'_>,
        resolved: &mut HashSet<EntryKey>,
    ) {
        let pending_fetches = AtomicUsize::new(photos.len());
        if photos.is_empty() {
            log_transition(advance(ctx.handle, JobState::Processing));
        }

        let fetched = stream::iter(photos)
            .map(|entry| {
                let pending = &pending_fetches;
                async move {
                    let result = self.fetcher.fetch(entry, &ctx.abort).await;
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        log_transition(advance(ctx.handle, JobState::Processing));
                    }
                    (entry, result)
                }
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .boxed();

        let mut outcomes = fetched
            .map(|(entry, result)| async move {
                let outcome = self.process(entry, result, ctx).await;
                (entry, outcome)
            })
            .buffer_unordered(self.config.process_concurrency.max(1))
            .boxed();

        while let Some((entry, outcome)) = outcomes.next().await {
            resolved.insert(entry.key);
            ctx.handle.update(|job| match outcome {
                EntryOutcome::Stored => job.counts.stored += 1,
                EntryOutcome::Duplicate => job.counts.duplicate += 1,
                EntryOutcome::Failed(failure) => {
                    warn!(
                        entry = %failure.key,
                        stage = %failure.stage,
                        reason = %failure.reason,
                        "Entry failed"
                    );
                    job.record_failure(failure);
                },
            });
        }
    }

    /// Reconstruct, deduplicate, store and index one fetched entry
    async fn process(
        &self,
        entry: &ManifestEntry,
        fetched: Result<FetchedPayload, FetchError>,
        ctx: &RunContext<'_>,
    ) -> EntryOutcome {
        let payload = match fetched {
            Ok(payload) => payload,
            Err(FetchError::Cancelled) => {
                return EntryOutcome::Failed(EntryFailure::for_entry(
                    entry,
                    EntryStage::Scheduling,
                    ctx.not_started_reason(),
                    true,
                ))
            },
            Err(e) => return self.entry_error(entry, EntryStage::Fetch, e.into(), ctx),
        };
        debug!(
            entry = %entry.key,
            kind = ?payload.kind,
            attempts = payload.attempts,
            "Fetched"
        );
        ctx.handle.update(|job| job.counts.fetched += 1);

        if ctx.abort.is_cancelled() {
            return EntryOutcome::Failed(EntryFailure::for_entry(
                entry,
                EntryStage::Scheduling,
                ctx.not_started_reason(),
                true,
            ));
        }

        let reconstructor = self.reconstructor;
        let kind = payload.kind;
        let bytes = payload.bytes;
        let image = match tokio::task::spawn_blocking(move || reconstructor.reconstruct(kind, &bytes))
            .await
        {
            Ok(Ok(image)) => image,
            Ok(Err(unsupported)) => {
                return self.entry_error(entry, EntryStage::Reconstruct, unsupported.into(), ctx)
            },
            Err(e) => {
                return EntryOutcome::Failed(EntryFailure::for_entry(
                    entry,
                    EntryStage::Reconstruct,
                    format!("reconstruction task failed: {}", e),
                    false,
                ))
            },
        };
        ctx.handle.update(|job| job.counts.reconstructed += 1);

        let identity = ImageIdentity::of(&image.bytes);
        debug!(
            entry = %entry.key,
            identity = %identity.short(),
            width = image.width,
            height = image.height,
            layers = image.layers,
            "Reconstructed"
        );
        let occurrence = Occurrence::from_entry(entry, ctx.handle.job_id());

        let claim = match self.dedup.admit(identity, occurrence).await {
            Ok(Admission::Duplicate { .. }) => return EntryOutcome::Duplicate,
            Ok(Admission::New(claim)) => claim,
            Err(e) => return self.entry_error(entry, EntryStage::Index, e.into(), ctx),
        };

        ctx.mark_writing(entry.key);
        let location = match self.sink.put(claim.identity(), image.bytes).await {
            Ok(location) => location,
            Err(e) => return self.entry_error(entry, EntryStage::Store, e.into(), ctx),
        };

        match claim.commit(location).await {
            Ok(outcome) if outcome.created => EntryOutcome::Stored,
            // Another job indexed the identity first
            Ok(_) => EntryOutcome::Duplicate,
            Err(e) => self.entry_error(entry, EntryStage::Index, e.into(), ctx),
        }
    }

    /// Record a failed entry; fatal errors also abort the run
    fn entry_error(
        &self,
        entry: &ManifestEntry,
        stage: EntryStage,
        err: IngestError,
        ctx: &RunContext<'_>,
    ) -> EntryOutcome {
        let retryable = match &err {
            IngestError::EntryFetchFailure(e) => e.is_retryable(),
            IngestError::UnsupportedAsset(_) => false,
            _ => true,
        };
        if err.is_fatal() {
            ctx.abort_with(&err);
        }
        EntryOutcome::Failed(EntryFailure::for_entry(entry, stage, err.to_string(), retryable))
    }
}

/// Move forward to `next` unless the job is already there or beyond
fn advance(handle: &JobHandle, next: JobState) -> Result<(), IngestError> {
    handle.update(|job| {
        if job.state == next || (!job.state.is_terminal() && !job.state.can_transition_to(next)) {
            return Ok(());
        }
        job.transition(next)?;
        info!(state = %next, "Job state changed");
        Ok(())
    })
}

fn log_transition(result: Result<(), IngestError>) {
    if let Err(e) = result {
        warn!(error = %e, "Job state not advanced");
    }
}
