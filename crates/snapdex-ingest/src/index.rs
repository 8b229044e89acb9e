//! Master index
//!
//! The durable record of every distinct image: identity → storage location
//! plus every sighting of that image in any manifest.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/master_index.json      snapshot: JSON array of entries
//! <dir>/master_index.journal   JSON lines appended since the snapshot
//! ```
//!
//! Every change is appended to the journal and synced before it becomes
//! visible in memory, so an acknowledged upsert survives a crash. Opening
//! loads the snapshot and replays the journal; replay tolerates records that
//! are already reflected in the snapshot and a torn final line.
//! [`MasterIndex::checkpoint`] folds the journal into a fresh snapshot.
//!
//! The index also owns the per-identity claim locks, so every job sharing
//! one index serializes on the same lock for the same identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapdex_common::ImageIdentity;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IndexError;
use crate::manifest::{ManifestEntry, MediaType};
use crate::storage::StorageLocation;

pub const SNAPSHOT_FILE: &str = "master_index.json";
pub const JOURNAL_FILE: &str = "master_index.journal";

/// One sighting of an image in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub captured_at: DateTime<Utc>,
    pub location: Option<String>,
    pub media_type: MediaType,
    pub source_ref: String,
    pub job_id: Uuid,
}

impl Occurrence {
    pub fn from_entry(entry: &ManifestEntry, job_id: Uuid) -> Self {
        Self {
            captured_at: entry.captured_at,
            location: entry.location.clone(),
            media_type: entry.media_type,
            source_ref: entry.source_ref.to_string(),
            job_id,
        }
    }

    /// Same sighting regardless of which job recorded it
    fn same_sighting(&self, other: &Occurrence) -> bool {
        self.captured_at == other.captured_at
            && self.location == other.location
            && self.media_type == other.media_type
            && self.source_ref == other.source_ref
    }
}

/// Index record for one distinct image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identity: ImageIdentity,
    pub storage_location: StorageLocation,
    pub first_seen: DateTime<Utc>,
    /// Job that first stored the image
    pub job_id: Uuid,
    pub occurrences: Vec<Occurrence>,
}

/// What an upsert changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    /// A new entry was created
    pub created: bool,
    /// An occurrence was appended (always true when `created`)
    pub occurrence_added: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Create {
        entry: IndexEntry,
    },
    Occurrence {
        identity: ImageIdentity,
        occurrence: Occurrence,
    },
}

#[derive(Debug, Default)]
struct Entries {
    ordered: Vec<IndexEntry>,
    positions: HashMap<ImageIdentity, usize>,
}

impl Entries {
    fn get(&self, identity: &ImageIdentity) -> Option<&IndexEntry> {
        self.positions.get(identity).map(|&i| &self.ordered[i])
    }

    /// Apply a record; returns false when it was already reflected
    fn apply(&mut self, record: JournalRecord) -> Result<bool, String> {
        match record {
            JournalRecord::Create { entry } => {
                if self.positions.contains_key(&entry.identity) {
                    return Ok(false);
                }
                self.positions.insert(entry.identity, self.ordered.len());
                self.ordered.push(entry);
                Ok(true)
            },
            JournalRecord::Occurrence {
                identity,
                occurrence,
            } => {
                let &i = self
                    .positions
                    .get(&identity)
                    .ok_or_else(|| format!("occurrence for unknown image {}", identity))?;
                let entry = &mut self.ordered[i];
                if entry.occurrences.iter().any(|o| o.same_sighting(&occurrence)) {
                    return Ok(false);
                }
                entry.occurrences.push(occurrence);
                Ok(true)
            },
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: Entries,
    journal: File,
    /// A failed append could not be rolled back; the journal tail is unknown
    broken: bool,
}

pub(crate) type ClaimLock = Arc<tokio::sync::Mutex<()>>;

/// Durable identity → location + provenance map, safe to share across tasks
#[derive(Debug)]
pub struct MasterIndex {
    dir: PathBuf,
    inner: Mutex<Inner>,
    claims: Mutex<HashMap<ImageIdentity, ClaimLock>>,
}

impl MasterIndex {
    /// Open (or create) the index stored in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| IndexError::io(&dir, e))?;

        let mut entries = load_snapshot(&dir.join(SNAPSHOT_FILE))?;
        let journal_path = dir.join(JOURNAL_FILE);
        let replayed = replay_journal(&journal_path, &mut entries)?;

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(|e| IndexError::io(&journal_path, e))?;

        info!(
            dir = %dir.display(),
            entries = entries.ordered.len(),
            replayed,
            "Opened master index"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                entries,
                journal,
                broken: false,
            }),
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        Ok(self.lock()?.entries.ordered.len())
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, identity: &ImageIdentity) -> Result<Option<IndexEntry>, IndexError> {
        Ok(self.lock()?.entries.get(identity).cloned())
    }

    pub fn contains(&self, identity: &ImageIdentity) -> Result<bool, IndexError> {
        Ok(self.lock()?.entries.positions.contains_key(identity))
    }

    /// All entries in the order they were first indexed
    pub fn all(&self) -> Result<Vec<IndexEntry>, IndexError> {
        Ok(self.lock()?.entries.ordered.clone())
    }

    /// Record a sighting of `identity`, creating the entry with `location` if
    /// it is new. A sighting already on the entry is not added twice.
    pub fn upsert(
        &self,
        identity: ImageIdentity,
        location: &StorageLocation,
        occurrence: Occurrence,
    ) -> Result<UpsertOutcome, IndexError> {
        let mut inner = self.lock()?;

        let record = match inner.entries.get(&identity) {
            Some(existing) => {
                if existing
                    .occurrences
                    .iter()
                    .any(|o| o.same_sighting(&occurrence))
                {
                    return Ok(UpsertOutcome::default());
                }
                JournalRecord::Occurrence {
                    identity,
                    occurrence,
                }
            },
            None => JournalRecord::Create {
                entry: IndexEntry {
                    identity,
                    storage_location: location.clone(),
                    first_seen: Utc::now(),
                    job_id: occurrence.job_id,
                    occurrences: vec![occurrence],
                },
            },
        };
        let created = matches!(record, JournalRecord::Create { .. });

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.append(&mut inner, |journal| {
            journal.write_all(&line)?;
            journal.sync_data()
        })?;

        inner
            .entries
            .apply(record)
            .map_err(|reason| IndexError::Corrupt { line: 0, reason })?;

        debug!(identity = %identity.short(), created, "Index upsert");
        Ok(UpsertOutcome {
            created,
            occurrence_added: true,
        })
    }

    /// Write a fresh snapshot and empty the journal
    pub fn checkpoint(&self) -> Result<(), IndexError> {
        let inner = self.lock()?;
        let snapshot_path = self.dir.join(SNAPSHOT_FILE);

        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| IndexError::io(&self.dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &inner.entries.ordered)?;
            writer
                .flush()
                .map_err(|e| IndexError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| IndexError::io(tmp.path(), e))?;
        tmp.persist(&snapshot_path)
            .map_err(|e| IndexError::io(&snapshot_path, e.error))?;

        let journal_path = self.dir.join(JOURNAL_FILE);
        inner
            .journal
            .set_len(0)
            .and_then(|_| inner.journal.sync_all())
            .map_err(|e| IndexError::io(&journal_path, e))?;

        info!(entries = inner.entries.ordered.len(), "Checkpointed master index");
        Ok(())
    }

    /// Shared lock for `identity`, created on first use
    pub(crate) fn claim_lock(&self, identity: ImageIdentity) -> ClaimLock {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity)
            .or_default()
            .clone()
    }

    /// Forget the lock for `identity` once nobody holds or waits on it
    pub(crate) fn release_claim(&self, identity: &ImageIdentity) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims
            .get(identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            claims.remove(identity);
        }
    }

    /// Identities currently claimed or waited on, across all jobs
    pub fn claims_in_flight(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `write` against the journal. On failure the journal is cut back to
    /// its previous length so a partial line never precedes later records.
    fn append<F>(&self, inner: &mut Inner, write: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let journal_path = self.dir.join(JOURNAL_FILE);
        if inner.broken {
            return Err(IndexError::io(
                &journal_path,
                io::Error::other("journal unusable after a failed append"),
            ));
        }

        let len = inner
            .journal
            .metadata()
            .map_err(|e| IndexError::io(&journal_path, e))?
            .len();
        if let Err(e) = write(&mut inner.journal) {
            if let Err(rollback) = inner.journal.set_len(len) {
                warn!(error = %rollback, "Journal rollback failed; refusing further appends");
                inner.broken = true;
            }
            return Err(IndexError::io(&journal_path, e));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, IndexError> {
        self.inner.lock().map_err(|_| IndexError::Poisoned)
    }
}

fn load_snapshot(path: &Path) -> Result<Entries, IndexError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::default()),
        Err(e) => return Err(IndexError::io(path, e)),
    };

    let ordered: Vec<IndexEntry> = serde_json::from_slice(&data)?;
    let mut entries = Entries::default();
    for entry in ordered {
        entries
            .apply(JournalRecord::Create { entry })
            .map_err(|reason| IndexError::Corrupt { line: 0, reason })?;
    }
    Ok(entries)
}

/// Replay journal records onto `entries`; returns how many changed state.
///
/// A final line that does not parse is a write torn by a crash: it is
/// dropped and the file truncated back to the last complete record.
fn replay_journal(path: &Path, entries: &mut Entries) -> Result<usize, IndexError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(IndexError::io(path, e)),
    };

    let mut applied = 0;
    let mut offset = 0usize;
    let lines: Vec<&[u8]> = data.split_inclusive(|&b| b == b'\n').collect();
    let last = lines.len().saturating_sub(1);

    for (i, raw) in lines.iter().copied().enumerate() {
        let line_no = i + 1;
        let text = raw.strip_suffix(b"\n").unwrap_or(raw);
        if text.iter().all(u8::is_ascii_whitespace) {
            offset += raw.len();
            continue;
        }

        let record: JournalRecord = match serde_json::from_slice(text) {
            Ok(record) => record,
            Err(e) if i == last => {
                warn!(line = line_no, error = %e, "Dropping torn journal tail");
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| IndexError::io(path, e))?;
                file.set_len(offset as u64)
                    .map_err(|e| IndexError::io(path, e))?;
                break;
            },
            Err(e) => {
                return Err(IndexError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                })
            },
        };

        if entries.apply(record).map_err(|reason| IndexError::Corrupt {
            line: line_no,
            reason,
        })? {
            applied += 1;
        }
        offset += raw.len();
    }

    Ok(applied)
}
