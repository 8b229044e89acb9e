//! Identity-level deduplication
//!
//! Decides, against the master index, whether a reconstructed image is new.
//! Concurrent tasks holding the same identity are serialized on the index's
//! per-identity lock, so exactly one of them gets a [`Claim`] and stores the
//! image; the others wait and then see it as a duplicate. The lock lives in
//! the [`MasterIndex`], so this holds across jobs sharing one index.

use snapdex_common::ImageIdentity;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::IndexError;
use crate::index::{MasterIndex, Occurrence, UpsertOutcome};
use crate::storage::StorageLocation;

/// Outcome of presenting an identity to the deduplicator
#[derive(Debug)]
pub enum Admission<'a> {
    /// Already indexed; the occurrence has been recorded against it
    Duplicate {
        location: StorageLocation,
        occurrence_added: bool,
    },
    /// Not indexed yet; the caller must store it and [`Claim::commit`]
    New(Claim<'a>),
}

/// Exclusive right to store one identity. Dropping it without committing
/// releases the identity for the next task to try.
#[derive(Debug)]
pub struct Claim<'a> {
    slot: Slot<'a>,
    occurrence: Occurrence,
}

impl Claim<'_> {
    pub fn identity(&self) -> &ImageIdentity {
        &self.slot.identity
    }

    /// Record the stored image in the index. `created` is false only if the
    /// index already held the identity when the claim was taken.
    pub async fn commit(self, location: StorageLocation) -> Result<UpsertOutcome, IndexError> {
        let outcome = self
            .slot
            .dedup
            .upsert(self.slot.identity, location, self.occurrence.clone())
            .await?;
        debug!(identity = %self.slot.identity.short(), "Committed new image");
        Ok(outcome)
    }
}

/// Holds an identity lock and prunes it from the index's table on drop
#[derive(Debug)]
struct Slot<'a> {
    dedup: &'a Deduplicator,
    identity: ImageIdentity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.dedup.index.release_claim(&self.identity);
    }
}

/// Per-job gatekeeper in front of the master index
#[derive(Debug)]
pub struct Deduplicator {
    index: Arc<MasterIndex>,
}

impl Deduplicator {
    pub fn new(index: Arc<MasterIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<MasterIndex> {
        &self.index
    }

    /// Present `identity` seen as `occurrence`.
    ///
    /// Waits while another task holds a claim on the same identity.
    pub async fn admit(
        &self,
        identity: ImageIdentity,
        occurrence: Occurrence,
    ) -> Result<Admission<'_>, IndexError> {
        let lock = self.index.claim_lock(identity);
        let slot = Slot {
            dedup: self,
            identity,
            guard: Some(lock.lock_owned().await),
        };

        match self.index.get(&identity)? {
            Some(existing) => {
                let outcome = self
                    .upsert(identity, existing.storage_location.clone(), occurrence)
                    .await?;
                drop(slot);
                debug!(
                    identity = %identity.short(),
                    occurrence_added = outcome.occurrence_added,
                    "Duplicate image"
                );
                Ok(Admission::Duplicate {
                    location: existing.storage_location,
                    occurrence_added: outcome.occurrence_added,
                })
            },
            None => Ok(Admission::New(Claim { slot, occurrence })),
        }
    }

    /// Index writes sync to disk, so they run off the async workers
    async fn upsert(
        &self,
        identity: ImageIdentity,
        location: StorageLocation,
        occurrence: Occurrence,
    ) -> Result<UpsertOutcome, IndexError> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.upsert(identity, &location, occurrence))
            .await
            .map_err(|e| IndexError::Task(e.to_string()))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::manifest::MediaType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn occurrence(source: &str) -> Occurrence {
        Occurrence {
            captured_at: "2024-03-15T14:30:45Z".parse().unwrap(),
            location: None,
            media_type: MediaType::Photo,
            source_ref: source.to_string(),
            job_id: Uuid::nil(),
        }
    }

    fn dedup(dir: &TempDir) -> Deduplicator {
        Deduplicator::new(Arc::new(MasterIndex::open(dir.path()).unwrap()))
    }

    #[tokio::test]
    async fn test_new_then_duplicate() {
        let dir = TempDir::new().unwrap();
        let dedup = dedup(&dir);
        let id = ImageIdentity::of(b"img");
        let location = StorageLocation::new("file:///images/x.jpg");

        match dedup.admit(id, occurrence("https://x/1")).await.unwrap() {
            Admission::New(claim) => {
                let outcome = claim.commit(location.clone()).await.unwrap();
                assert!(outcome.created);
            },
            Admission::Duplicate { .. } => panic!("first sighting must be new"),
        }

        match dedup.admit(id, occurrence("https://x/2")).await.unwrap() {
            Admission::Duplicate {
                location: seen,
                occurrence_added,
            } => {
                assert_eq!(seen, location);
                assert!(occurrence_added);
            },
            Admission::New(_) => panic!("second sighting must be a duplicate"),
        }

        assert_eq!(dedup.index().get(&id).unwrap().unwrap().occurrences.len(), 2);
        assert_eq!(dedup.index().claims_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_claim_lets_next_task_claim() {
        let dir = TempDir::new().unwrap();
        let dedup = dedup(&dir);
        let id = ImageIdentity::of(b"img");

        let first = dedup.admit(id, occurrence("https://x/1")).await.unwrap();
        assert!(matches!(first, Admission::New(_)));
        drop(first);

        let second = dedup.admit(id, occurrence("https://x/2")).await.unwrap();
        assert!(matches!(second, Admission::New(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_tasks_claim_once() {
        let dir = TempDir::new().unwrap();
        let dedup = Arc::new(dedup(&dir));
        let id = ImageIdentity::of(b"same pixels");
        let claims = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let dedup = Arc::clone(&dedup);
                let claims = Arc::clone(&claims);
                tokio::spawn(async move {
                    let admission = dedup
                        .admit(id, occurrence(&format!("https://x/{}", i)))
                        .await
                        .unwrap();
                    if let Admission::New(claim) = admission {
                        claims.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        claim
                            .commit(StorageLocation::new("file:///images/same.jpg"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(claims.load(Ordering::SeqCst), 1);
        let entry = dedup.index().get(&id).unwrap().unwrap();
        assert_eq!(entry.occurrences.len(), 16);
        assert_eq!(dedup.index().claims_in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deduplicators_sharing_an_index_claim_once() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(MasterIndex::open(dir.path()).unwrap());
        let id = ImageIdentity::of(b"same pixels");
        let claims = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                // One deduplicator per task, as two jobs would each build their own
                let dedup = Deduplicator::new(Arc::clone(&index));
                let claims = Arc::clone(&claims);
                tokio::spawn(async move {
                    let admission = dedup
                        .admit(id, occurrence(&format!("https://job{}/1", i)))
                        .await
                        .unwrap();
                    if let Admission::New(claim) = admission {
                        claims.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        claim
                            .commit(StorageLocation::new("file:///images/same.jpg"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(claims.load(Ordering::SeqCst), 1);
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.get(&id).unwrap().unwrap().occurrences.len(), 8);
        assert_eq!(index.claims_in_flight(), 0);
    }
}
