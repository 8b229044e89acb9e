//! Snapdex Ingest - memories export ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use snapdex_common::logging::{init_logging, LogConfig};
use snapdex_common::ImageIdentity;
use snapdex_ingest::manifest::ManifestParser;
use snapdex_ingest::storage::StorageBackend;
use snapdex_ingest::{IngestConfig, IngestJob, JobHandle, JobOrchestrator, JobState, MasterIndex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "snapdex-ingest")]
#[command(author, version, about = "Ingest a Snapchat memories export into a deduplicated image store")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Root directory for the index, local storage and job records
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Storage backend
    #[arg(long, global = true, value_parser = ["local", "s3"])]
    storage: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an ingestion job for a manifest
    Ingest {
        /// Path to memories_history.json
        manifest: PathBuf,

        /// Write the retryable failures to this file as a new manifest
        #[arg(long)]
        retry_out: Option<PathBuf>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Parse a manifest and report what would be ingested
    Parse {
        manifest: PathBuf,
    },

    /// Inspect the master index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show a finished job's record
    Status {
        job_id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum IndexAction {
    /// List every indexed image
    List {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one image's entry
    Show {
        /// Hex identity of the image
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = IngestConfig::from_env()?;
    if let Some(ref dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(ref name) = cli.storage {
        let storage = snapdex_ingest::StorageBackendKind::from_name(name, |key| std::env::var(key).ok())?;
        config = config.with_storage(storage);
    }

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_dir(config.logs_dir())
        .log_file_prefix("snapdex-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _log_guard = init_logging(&log_config)?;

    match cli.command {
        Command::Ingest {
            manifest,
            retry_out,
            no_progress,
        } => ingest(&config, &manifest, retry_out.as_deref(), !no_progress).await,
        Command::Parse { manifest } => parse(&manifest),
        Command::Index { action } => index(&config, action),
        Command::Status { job_id } => status(&config, job_id),
    }
}

async fn ingest(
    config: &IngestConfig,
    manifest_path: &Path,
    retry_out: Option<&Path>,
    show_progress: bool,
) -> Result<()> {
    let manifest = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("Failed to read manifest {}", manifest_path.display()))?;

    let index = Arc::new(MasterIndex::open(config.index_dir())?);
    let sink = Arc::new(StorageBackend::from_config(config));
    let orchestrator = JobOrchestrator::new(config.pipeline(), index, sink)?;

    let handle = orchestrator.create_job();
    info!(job_id = %handle.job_id(), manifest = %manifest_path.display(), "Starting ingestion");

    let ctrl_c = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling job");
                handle.cancel();
            }
        })
    };
    let progress = show_progress.then(|| tokio::spawn(track_progress(handle.clone())));

    let job = orchestrator.execute(&handle, &manifest).await;

    ctrl_c.abort();
    if let Some(progress) = progress {
        progress.await.ok();
    }

    let record = job.save(&config.jobs_dir())?;
    info!(path = %record.display(), "Saved job record");

    if let Some(path) = retry_out {
        match job.retry_manifest() {
            Some(doc) => {
                std::fs::write(path, serde_json::to_string_pretty(&doc)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "Wrote retry manifest");
            },
            None => info!("Nothing to retry"),
        }
    }

    print_summary(&job);

    if job.state == JobState::Failed {
        anyhow::bail!(
            "Job {} failed: {}",
            job.job_id,
            job.failure.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

async fn track_progress(handle: JobHandle) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        let state = handle.state();
        let counts = handle.counts();
        bar.set_length(counts.total as u64);
        bar.set_position(counts.resolved() as u64);
        bar.set_message(format!(
            "{} (stored {}, duplicate {}, failed {})",
            state, counts.stored, counts.duplicate, counts.failed
        ));
        if state.is_terminal() {
            break;
        }
    }
    bar.finish_and_clear();
}

fn print_summary(job: &IngestJob) {
    let c = &job.counts;
    println!("Job {}: {}", job.job_id, job.state);
    println!("  total:         {}", c.total);
    println!("  fetched:       {}", c.fetched);
    println!("  reconstructed: {}", c.reconstructed);
    println!("  stored:        {}", c.stored);
    println!("  duplicate:     {}", c.duplicate);
    println!("  skipped:       {}", c.skipped);
    println!("  failed:        {}", c.failed);
    if let Some(ref reason) = job.failure {
        println!("  reason:        {}", reason);
    }
    for failure in job.errors.iter().take(20) {
        println!(
            "  - {} [{}] {}{}",
            failure.key,
            failure.stage,
            failure.reason,
            if failure.retryable { " (retryable)" } else { "" }
        );
    }
    if job.errors.len() > 20 {
        println!("  ... and {} more", job.errors.len() - 20);
    }
}

fn parse(manifest_path: &Path) -> Result<()> {
    let manifest = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("Failed to read manifest {}", manifest_path.display()))?;
    let parsed = ManifestParser::new().parse(&manifest)?;

    println!("records:  {}", parsed.total_records);
    println!("photos:   {}", parsed.photos().count());
    println!("videos:   {}", parsed.video_count());
    println!("invalid:  {}", parsed.failures.len());
    for failure in &parsed.failures {
        println!("  - {} {}", failure.key, failure.reason);
    }
    Ok(())
}

fn index(config: &IngestConfig, action: IndexAction) -> Result<()> {
    let index = MasterIndex::open(config.index_dir())?;

    match action {
        IndexAction::List { json } => {
            let entries = index.all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{}  {:>3}  {}",
                        entry.identity,
                        entry.occurrences.len(),
                        entry.storage_location
                    );
                }
                println!("{} image(s)", entries.len());
            }
        },
        IndexAction::Show { identity } => {
            let identity: ImageIdentity = identity.parse()?;
            let entry = index
                .get(&identity)?
                .with_context(|| format!("Image {} is not indexed", identity))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        },
    }
    Ok(())
}

fn status(config: &IngestConfig, job_id: Uuid) -> Result<()> {
    let path = config.jobs_dir().join(format!("{}.json", job_id));
    let job = IngestJob::load(&path)
        .with_context(|| format!("No job record at {}", path.display()))?;
    print_summary(&job);
    Ok(())
}
