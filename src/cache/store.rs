//! On-disk artifact store holding at most one generated card per key.
//!
//! Cards are stored under `{base_path}/{owner}/{repo}-{digest}-{seq}.png`,
//! where `seq` is unique per publish so no two records share a file.  A new
//! card is written to a temporary file in the same directory, synced, and
//! renamed into place before the in-memory index is switched over to it.
//! The superseded file is deleted only after the switch, so a lookup never
//! observes a half-written artifact.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::Clock;
use crate::error::CardError;
use crate::generator::RepoMetadata;

const CARD_EXTENSION: &str = "png";
const TEMP_PREFIX: &str = ".card-";
const TEMP_SUFFIX: &str = ".tmp";
const DIGEST_LEN: usize = 16;

// ---------------------------------------------------------------------------
// ArtifactRecord
// ---------------------------------------------------------------------------

/// One stored card and the metadata captured when it was generated.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub key: CacheKey,
    /// Exclusive location of the card bytes.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Quoted strong validator derived from the card bytes.
    pub etag: String,
    pub size_bytes: u64,
    pub metadata: RepoMetadata,
}

impl ArtifactRecord {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Maps each [`CacheKey`] to its current [`ArtifactRecord`] and owns the
/// backing files.  Cheap to clone; clones share the same index.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    base_path: PathBuf,
    records: RwLock<HashMap<CacheKey, Arc<ArtifactRecord>>>,
    next_seq: AtomicU64,
    clock: Clock,
}

impl ArtifactStore {
    /// Open the store rooted at `base_path`, creating the directory and
    /// purging cards left behind by a previous process.
    pub fn open(base_path: impl Into<PathBuf>, clock: Clock) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("failed to create card directory: {}", base_path.display())
        })?;
        let purged = purge_leftovers(&base_path)?;
        if purged > 0 {
            info!(purged, path = %base_path.display(), "removed cards from a previous run");
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                base_path,
                records: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                clock,
            }),
        })
    }

    /// Number of keys that currently have a card.
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// Current record for `key`, if any.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<ArtifactRecord>> {
        self.inner.records.read().get(key).cloned()
    }

    /// Durably write `bytes` as the new card for `key` and make it the
    /// current record, deleting the file it supersedes.
    ///
    /// Only the single generation owner for `key` calls this.  On failure the
    /// previous record stays current and untouched.
    pub async fn publish(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: RepoMetadata,
    ) -> Result<Arc<ArtifactRecord>, CardError> {
        let digest = hex::encode(Sha256::digest(&bytes));
        let digest = &digest[..DIGEST_LEN];
        let etag = format!("\"{digest}\"");
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.inner.base_path.join(key.owner());
        let path = dir.join(format!("{}-{digest}-{seq}.{CARD_EXTENSION}", key.repo()));

        let size_bytes = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &bytes))
                .await
                .map_err(|e| CardError::Storage(format!("write task failed: {e}")))??
        };

        let record = Arc::new(ArtifactRecord {
            key: key.clone(),
            path,
            created_at: (self.inner.clock)(),
            etag,
            size_bytes,
            metadata,
        });

        let previous = self
            .inner
            .records
            .write()
            .insert(key.clone(), Arc::clone(&record));

        if let Some(previous) = previous
            && previous.path != record.path
        {
            remove_superseded(&previous.path).await;
        }

        debug!(
            repo = %key,
            etag = %record.etag,
            size_bytes = record.size_bytes,
            "card published"
        );
        Ok(record)
    }

    /// Remove the record for `key` and its backing file.
    pub async fn evict(&self, key: &CacheKey) -> Option<Arc<ArtifactRecord>> {
        let removed = self.inner.records.write().remove(key)?;
        remove_superseded(&removed.path).await;
        debug!(repo = %key, "card evicted");
        Some(removed)
    }

    /// Drop the index entry for `record.key` if it still points at
    /// `record`.  Returns whether anything was removed.
    ///
    /// Used when the backing file of `record` has gone missing; a newer
    /// record published in the meantime is left alone.
    pub fn discard_if_current(&self, record: &ArtifactRecord) -> bool {
        let mut records = self.inner.records.write();
        match records.get(&record.key) {
            Some(current) if current.path == record.path => {
                records.remove(&record.key);
                true
            }
            _ => false,
        }
    }

    /// Read the bytes of `record` from disk.
    pub async fn read(&self, record: &ArtifactRecord) -> std::io::Result<Bytes> {
        tokio::fs::read(&record.path).await.map(Bytes::from)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Write `bytes` to a synced temporary file in `dir`, then rename it to
/// `path`.  Returns the number of bytes written.
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<u64, CardError> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CardError::Storage(e.error.to_string()))?;
    Ok(bytes.len() as u64)
}

async fn remove_superseded(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed superseded card"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "failed to remove superseded card"),
    }
}

/// Delete card and temporary files under `{base}/{owner}/` and drop owner
/// directories that end up empty.  Only names this store writes are
/// touched; other files are left alone.
fn purge_leftovers(base: &Path) -> Result<usize> {
    let mut purged = 0;
    let owners = std::fs::read_dir(base)
        .with_context(|| format!("failed to read card directory: {}", base.display()))?;

    for owner_entry in owners {
        let owner_entry = owner_entry?;
        if !owner_entry.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(owner_entry.path())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_file() && is_store_file(&name) {
                std::fs::remove_file(entry.path())?;
                purged += 1;
            }
        }
        // Fails harmlessly when something else still lives there.
        let _ = std::fs::remove_dir(owner_entry.path());
    }
    Ok(purged)
}

/// Matches `.card-*.tmp` and `{repo}-{16 hex}-{seq}.png`.
fn is_store_file(name: &str) -> bool {
    if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
        return true;
    }
    let Some(stem) = name.strip_suffix(&format!(".{CARD_EXTENSION}")) else {
        return false;
    };
    let Some((rest, seq)) = stem.rsplit_once('-') else {
        return false;
    };
    let Some((repo, digest)) = rest.rsplit_once('-') else {
        return false;
    };
    !repo.is_empty()
        && digest.len() == DIGEST_LEN
        && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && !seq.is_empty()
        && seq.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::system_clock;

    fn key() -> CacheKey {
        CacheKey::new("acme", "widgets").unwrap()
    }

    fn metadata(stars: u64) -> RepoMetadata {
        RepoMetadata {
            stars,
            ..RepoMetadata::default()
        }
    }

    fn card_files(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn lookup_on_empty_store_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();
        assert!(store.lookup(&key()).is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn publish_installs_record_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();

        let record = store
            .publish(&key(), Bytes::from_static(b"card-v1"), metadata(7))
            .await
            .unwrap();

        assert_eq!(store.lookup(&key()).as_deref(), Some(&*record));
        assert!(record.path.starts_with(tmp.path().join("acme")));
        assert!(record.file_name().starts_with("widgets-"));
        assert!(record.etag.starts_with('"') && record.etag.ends_with('"'));
        assert_eq!(record.size_bytes, 7);
        assert_eq!(record.metadata.stars, 7);
        assert_eq!(store.read(&record).await.unwrap(), Bytes::from_static(b"card-v1"));
    }

    #[tokio::test]
    async fn publish_supersedes_and_deletes_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();

        let v1 = store
            .publish(&key(), Bytes::from_static(b"card-v1"), metadata(1))
            .await
            .unwrap();
        let v2 = store
            .publish(&key(), Bytes::from_static(b"card-v2"), metadata(2))
            .await
            .unwrap();

        assert_ne!(v1.etag, v2.etag);
        let current = store.lookup(&key()).unwrap();
        assert_eq!(current.etag, v2.etag);
        assert!(!v1.path.exists());
        assert_eq!(store.read(&current).await.unwrap(), Bytes::from_static(b"card-v2"));
    }

    #[tokio::test]
    async fn repeated_publishes_leave_exactly_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();

        for i in 0..5 {
            store
                .publish(&key(), Bytes::from(format!("card-{i}")), metadata(i))
                .await
                .unwrap();
        }
        // Identical bytes still get a file of their own.
        store
            .publish(&key(), Bytes::from_static(b"card-4"), metadata(4))
            .await
            .unwrap();

        let files = card_files(&tmp.path().join("acme"));
        assert_eq!(files.len(), 1, "{files:?}");
        assert_eq!(files[0], store.lookup(&key()).unwrap().path);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_keeps_previous_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();
        let v1 = store
            .publish(&key(), Bytes::from_static(b"card-v1"), metadata(1))
            .await
            .unwrap();

        // Replace the owner directory with a plain file so the next write fails.
        let owner_dir = tmp.path().join("acme");
        let v1_bytes = std::fs::read(&v1.path).unwrap();
        std::fs::remove_dir_all(&owner_dir).unwrap();
        std::fs::write(&owner_dir, b"not a directory").unwrap();

        let err = store
            .publish(&key(), Bytes::from_static(b"card-v2"), metadata(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CardError::Storage(_)));
        assert_eq!(store.lookup(&key()).unwrap().etag, v1.etag);
        assert_eq!(v1_bytes, b"card-v1");
    }

    #[tokio::test]
    async fn evict_removes_record_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();
        let record = store
            .publish(&key(), Bytes::from_static(b"card"), metadata(0))
            .await
            .unwrap();

        let evicted = store.evict(&key()).await.unwrap();
        assert_eq!(evicted.etag, record.etag);
        assert!(store.lookup(&key()).is_none());
        assert!(!record.path.exists());
        assert!(store.evict(&key()).await.is_none());
    }

    #[tokio::test]
    async fn evicted_path_is_never_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();
        let v1 = store
            .publish(&key(), Bytes::from_static(b"card"), metadata(0))
            .await
            .unwrap();

        store.evict(&key()).await.unwrap();
        let v2 = store
            .publish(&key(), Bytes::from_static(b"card"), metadata(0))
            .await
            .unwrap();

        // Same bytes, same etag, different file.
        assert_eq!(v1.etag, v2.etag);
        assert_ne!(v1.path, v2.path);
        // A late unlink of the evicted path leaves the live card intact.
        let _ = std::fs::remove_file(&v1.path);
        assert_eq!(store.read(&v2).await.unwrap(), Bytes::from_static(b"card"));
    }

    #[tokio::test]
    async fn discard_if_current_spares_newer_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();
        let v1 = store
            .publish(&key(), Bytes::from_static(b"card-v1"), metadata(1))
            .await
            .unwrap();
        let v2 = store
            .publish(&key(), Bytes::from_static(b"card-v2"), metadata(2))
            .await
            .unwrap();

        assert!(!store.discard_if_current(&v1));
        assert_eq!(store.lookup(&key()).unwrap().etag, v2.etag);

        assert!(store.discard_if_current(&v2));
        assert!(store.lookup(&key()).is_none());
        assert!(!store.discard_if_current(&v2));
    }

    #[test]
    fn store_file_names() {
        assert!(is_store_file("widgets-0123456789abcdef-0.png"));
        assert!(is_store_file("my-repo-0123456789abcdef-42.png"));
        assert!(is_store_file(".card-a1B2c3.tmp"));
        assert!(!is_store_file("logo.png"));
        assert!(!is_store_file("widgets-0123456789abcdef.png"));
        assert!(!is_store_file("widgets-0123456789ABCDEF-0.png"));
        assert!(!is_store_file("-0123456789abcdef-0.png"));
        assert!(!is_store_file("widgets-0123456789abcdef-x.png"));
        assert!(!is_store_file("notes.tmp"));
    }

    #[test]
    fn open_keeps_unrelated_images() {
        let tmp = tempfile::tempdir().unwrap();
        let photos = tmp.path().join("photos");
        std::fs::create_dir_all(&photos).unwrap();
        std::fs::write(photos.join("holiday.png"), b"jpeg-ish").unwrap();
        std::fs::write(photos.join("widgets-0123456789abcdef-3.png"), b"old").unwrap();

        ArtifactStore::open(tmp.path(), system_clock()).unwrap();

        assert!(photos.join("holiday.png").exists());
        assert!(!photos.join("widgets-0123456789abcdef-3.png").exists());
    }

    #[test]
    fn open_purges_cards_from_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let owner = tmp.path().join("acme");
        std::fs::create_dir_all(&owner).unwrap();
        std::fs::write(owner.join("widgets-0123456789abcdef-0.png"), b"old").unwrap();
        std::fs::write(owner.join(".card-xyz.tmp"), b"partial").unwrap();
        std::fs::write(tmp.path().join("README"), b"keep").unwrap();

        let store = ArtifactStore::open(tmp.path(), system_clock()).unwrap();

        assert_eq!(store.len(), 0);
        assert!(!owner.exists());
        assert!(tmp.path().join("README").exists());
    }
}
