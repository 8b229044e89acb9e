//! Snapdex Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingestion core for personal media exports (Snapchat "memories").
//!
//! A run takes a manifest document through these stages:
//!
//! - **manifest**: decode the export into typed [`ManifestEntry`] values
//! - **fetch**: download each entry's bytes with bounded concurrency and retry
//! - **reconstruct**: flatten plain images and base + overlay archives into one
//!   canonical JPEG
//! - **dedup**: name the image by content and claim it against the master index
//! - **storage**: persist each distinct image once, keyed only by identity
//! - **index**: record identity → location + provenance durably
//!
//! [`JobOrchestrator`] drives a run through the [`JobState`] machine and keeps
//! per-entry outcomes and counts on the job.
//!
//! # Example
//!
//! ```no_run
//! use snapdex_ingest::{IngestConfig, JobOrchestrator, MasterIndex};
//! use snapdex_ingest::storage::LocalStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let index = Arc::new(MasterIndex::open(config.index_dir())?);
//!     let sink = Arc::new(LocalStorage::new(config.local_storage_dir()));
//!     let orchestrator = JobOrchestrator::new(config.pipeline(), index, sink)?;
//!
//!     let manifest = std::fs::read_to_string("memories_history.json")?;
//!     let job = orchestrator.run(&manifest).await;
//!     println!("{:?}: {:?}", job.state, job.counts);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod index;
pub mod job;
pub mod manifest;
pub mod orchestrator;
pub mod reconstruct;
pub mod storage;

pub use config::{IngestConfig, PipelineConfig, StorageBackendKind};
pub use dedup::{Admission, Claim, Deduplicator};
pub use error::IngestError;
pub use fetch::{ContentFetcher, FetchedPayload, PayloadKind, RetryPolicy};
pub use index::{IndexEntry, MasterIndex, Occurrence, UpsertOutcome};
pub use job::{EntryFailure, EntryStage, IngestJob, JobCounts, JobHandle, JobRegistry, JobState};
pub use manifest::{EntryKey, ManifestEntry, MediaType, ParsedManifest};
pub use orchestrator::JobOrchestrator;
pub use reconstruct::{AssetReconstructor, ReconstructedImage};
pub use storage::{StorageBackend, StorageLocation, StorageSink};
