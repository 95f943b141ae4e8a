//! Directory-backed merge request record store.
//!
//! One JSON document per merge request under `<root>/mrs/<id>.json`.
//! Every mutation is a single-file operation: writes go to a dot-prefixed
//! temp file in the same directory and are renamed over the target, so a
//! reader never observes a partially written record. Readers skip
//! anything that fails to parse.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::io::AsyncWriteExt;

use crate::{
    mr::{MergeRequest, MrId, Submission},
    Error, Result,
};

const RECORDS_DIR: &str = "mrs";
const LOCKS_DIR: &str = "locks";
const RECORD_EXT: &str = "json";

/// Capability handle over one queue directory.
///
/// Cheap to clone; every component receives the store explicitly.
#[derive(Debug, Clone)]
pub struct MrStore {
    root: PathBuf,
}

impl MrStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the directories cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(RECORDS_DIR), root.join(LOCKS_DIR)] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(Self { root })
    }

    /// Root directory of the queue
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &MrId) -> PathBuf {
        self.root
            .join(RECORDS_DIR)
            .join(format!("{}.{RECORD_EXT}", id.as_str()))
    }

    fn lock_path(&self, id: &MrId) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", id.as_str()))
    }

    /// Persist a new merge request, assigning `id` and `created_at` when absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O failure, an invalid explicit id, or an
    /// explicit id that already exists.
    pub async fn submit(&self, submission: Submission) -> Result<MergeRequest> {
        let now = Utc::now();
        let created_at = submission.created_at.unwrap_or(now);

        let id = match submission.id.clone() {
            Some(id) => {
                if !id.is_valid() {
                    return Err(Error::Storage(format!("invalid merge request id '{id}'")));
                }
                if self.exists(&id).await {
                    return Err(Error::Storage(format!("merge request {id} already exists")));
                }
                id
            }
            None => self.fresh_id(now).await,
        };

        let record = submission.into_record(id, created_at);
        self.put(&record).await?;

        tracing::info!(
            mr_id = %record.id,
            branch = %record.branch,
            target = %record.target,
            priority = record.priority,
            "Submitted merge request"
        );
        Ok(record)
    }

    /// Time-seeded id with a random suffix; retried on the rare collision.
    async fn fresh_id(&self, now: DateTime<Utc>) -> MrId {
        loop {
            let id = generate_id(now);
            if !self.exists(&id).await {
                return id;
            }
        }
    }

    async fn exists(&self, id: &MrId) -> bool {
        tokio::fs::try_exists(self.record_path(id))
            .await
            .unwrap_or(false)
    }

    /// Atomically replace (or create) the record for `mr.id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O or serialization failure.
    pub async fn put(&self, mr: &MergeRequest) -> Result<()> {
        if !mr.id.is_valid() {
            return Err(Error::Storage(format!("invalid merge request id '{}'", mr.id)));
        }
        let json = serde_json::to_vec_pretty(mr)?;
        write_atomic(&self.record_path(&mr.id), &json).await
    }

    /// Locked read-modify-write of one record.
    ///
    /// `apply` may veto the write by returning an error, which is passed through.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the record is absent, `Error::Storage` on
    /// I/O failure, or whatever `apply` returns.
    pub async fn update<F>(&self, id: &MrId, apply: F) -> Result<MergeRequest>
    where
        F: FnOnce(&mut MergeRequest) -> Result<()> + Send,
    {
        // Fail fast without creating a lock file for unknown ids.
        self.get(id).await?;

        let guard = self.lock_record(id).await?;
        let mut mr = self.get(id).await?;
        apply(&mut mr)?;
        mr.updated_at = Some(Utc::now());
        self.put(&mr).await?;
        drop(guard);
        Ok(mr)
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if absent, `Error::Storage` if unreadable or malformed.
    pub async fn get(&self, id: &MrId) -> Result<MergeRequest> {
        if !id.is_valid() {
            return Err(Error::NotFound(id.to_string()));
        }
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_string()));
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All well-formed records, ordered by priority then age.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the records directory cannot be enumerated.
    pub async fn list(&self) -> Result<Vec<MergeRequest>> {
        let mut records = Vec::new();
        for path in self.record_files().await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // removed between enumeration and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_slice::<MergeRequest>(&bytes) {
                Ok(mr) => records.push(mr),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed record");
                }
            }
        }
        sort_queue_order(&mut records);
        Ok(records)
    }

    /// Delete a record under its lock. Removing an absent record succeeds.
    ///
    /// The lock file is kept so an `update` waiting on the lock sees the
    /// record gone instead of writing it back.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on any I/O failure other than not-found.
    pub async fn remove(&self, id: &MrId) -> Result<()> {
        if !id.is_valid() {
            return Ok(());
        }
        let path = self.record_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(true) {
            tracing::debug!(mr_id = %id, "Record already absent");
            return Ok(());
        }

        let guard = self.lock_record(id).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(mr_id = %id, "Removed merge request record"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(mr_id = %id, "Record already absent");
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to remove {}: {e}",
                    path.display()
                )));
            }
        }
        drop(guard);
        Ok(())
    }

    /// Number of well-formed records; agrees with [`MrStore::list`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the records directory cannot be enumerated.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    async fn record_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(RECORDS_DIR);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Storage(format!("failed to read {}: {e}", dir.display())))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("failed to read {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if is_record_file(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Take the cross-process exclusive lock guarding read-modify-write of one record.
    ///
    /// Blocks (off the async executor) until the lock is granted; released on drop.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the lock file cannot be opened or locked.
    pub async fn lock_record(&self, id: &MrId) -> Result<RecordLock> {
        let path = self.lock_path(id);
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::Storage(format!("lock task failed: {e}")))?
        .map_err(|e| Error::Storage(format!("failed to lock {}: {e}", path.display())))?;

        Ok(RecordLock { file, path })
    }
}

/// Exclusive advisory lock on one record; released when dropped.
#[derive(Debug)]
pub struct RecordLock {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to unlock record");
        }
    }
}

/// Sort by priority ascending, then creation time (FIFO within a band).
pub fn sort_queue_order(records: &mut [MergeRequest]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == RECORD_EXT)
}

fn generate_id(now: DateTime<Utc>) -> MrId {
    let suffix: u32 = rand::random();
    MrId::new(format!("mr-{}-{suffix:08x}", now.timestamp_millis()))
}

/// Write-to-temp, fsync, rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("no parent directory for {}", path.display())))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Storage(format!("invalid record path {}", path.display())))?;
    let nonce: u32 = rand::random();
    let tmp_path = dir.join(format!(".{name}.{nonce:08x}.tmp"));

    let write = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Storage(format!(
            "failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;

    async fn temp_store() -> (TempDir, MrStore) {
        let dir = TempDir::new().unwrap();
        let store = MrStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_submit_assigns_id_and_created_at() {
        let (_dir, store) = temp_store().await;
        let mr = store
            .submit(Submission::new("work/a", "main").with_priority(5))
            .await
            .unwrap();

        assert!(mr.id.as_str().starts_with("mr-"));
        assert!(mr.id.is_valid());
        let loaded = store.get(&mr.id).await.unwrap();
        assert_eq!(loaded, mr);
    }

    #[tokio::test]
    async fn test_submit_keeps_explicit_id_and_rejects_duplicates() {
        let (_dir, store) = temp_store().await;
        let sub = Submission::new("work/a", "main").with_id("mr-fixed");
        let mr = store.submit(sub.clone()).await.unwrap();
        assert_eq!(mr.id.as_str(), "mr-fixed");

        let err = store.submit(sub).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_distinct_ids() {
        let (_dir, store) = temp_store().await;
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .submit(Submission::new(format!("work/{i}"), "main"))
                        .await
                })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(store.count().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.get(&MrId::new("mr-nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_twice_is_ok() {
        let (_dir, store) = temp_store().await;
        let mr = store.submit(Submission::new("b", "main")).await.unwrap();
        store.remove(&mr.id).await.unwrap();
        store.remove(&mr.id).await.unwrap();
        assert!(matches!(store.get(&mr.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_after_remove_is_not_found() {
        let (_dir, store) = temp_store().await;
        let mr = store.submit(Submission::new("b", "main")).await.unwrap();
        store.remove(&mr.id).await.unwrap();

        let err = store
            .update(&mr.id, |mr| {
                mr.title = "revived".into();
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert!(!store.record_path(&mr.id).exists());
        assert!(matches!(store.get(&mr.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_racing_update_never_revives_record() {
        for _ in 0..20 {
            let (_dir, store) = temp_store().await;
            let mr = store.submit(Submission::new("b", "main")).await.unwrap();

            let (removed, updated) = tokio::join!(
                store.remove(&mr.id),
                store.update(&mr.id, |mr| {
                    mr.title = "late write".into();
                    Ok(())
                })
            );

            removed.unwrap();
            if let Err(e) = updated {
                assert!(matches!(e, Error::NotFound(_)), "unexpected error: {e}");
            }
            assert!(matches!(store.get(&mr.id).await, Err(Error::NotFound(_))));
            assert_eq!(store.count().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_list_orders_by_priority_then_age() {
        let (_dir, store) = temp_store().await;
        let base = Utc::now();
        for (i, p) in [3, 1, 2].into_iter().enumerate() {
            store
                .submit(
                    Submission::new(format!("b{p}"), "main")
                        .with_priority(p)
                        .with_created_at(base + Duration::seconds(i as i64)),
                )
                .await
                .unwrap();
        }
        store
            .submit(
                Submission::new("late-1", "main")
                    .with_priority(1)
                    .with_created_at(base + Duration::seconds(10)),
            )
            .await
            .unwrap();

        let branches: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.branch)
            .collect();
        assert_eq!(branches, vec!["b1", "late-1", "b2", "b3"]);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_and_temp_files() {
        let (dir, store) = temp_store().await;
        store.submit(Submission::new("good", "main")).await.unwrap();

        let records = dir.path().join(RECORDS_DIR);
        std::fs::write(records.join("broken.json"), b"{\"id\": \"half").unwrap();
        std::fs::write(records.join(".mr-x.json.1234.tmp"), b"{}").unwrap();
        std::fs::write(records.join("notes.txt"), b"ignored").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].branch, "good");
    }

    #[tokio::test]
    async fn test_count_ignores_malformed_records() {
        let (dir, store) = temp_store().await;
        store.submit(Submission::new("good", "main")).await.unwrap();
        store.submit(Submission::new("also-good", "main")).await.unwrap();
        std::fs::write(dir.path().join(RECORDS_DIR).join("broken.json"), b"not json").unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), store.list().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let (dir, store) = temp_store().await;
        let mut mr = store.submit(Submission::new("b", "main")).await.unwrap();
        mr.title = "renamed".into();
        store.put(&mr).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(RECORDS_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.get(&mr.id).await.unwrap().title, "renamed");
    }
}
