// # File Store
//
// File-based implementation of Store with crash recovery, shareable by
// several processes.
//
// ## Durability
//
// - Atomic writes: every mutation writes a full image to a temporary file
//   and renames it over the store file
// - Backup: the previous image is kept as `.backup`
// - Recovery: a corrupt store file falls back to the backup
//
// ## Sharing
//
// Every operation runs under an exclusive OS lock on the sidecar `.lock`
// file and works on the image read from disk under that lock. Processes
// pointed at the same path (an API process and `--worker` processes, for
// example) therefore see each other's writes and never overwrite them.
// Within one process a mutex queues tasks before the OS lock is taken.
//
// A mutation is applied to the freshly loaded tables and persisted before
// the lock is released; a failed mutation writes nothing.
//
// ## File Format
//
// ```json
// {
//   "version": "1",
//   "tables": {
//     "resources": { "orn:entropy:log:p1:a": { ... } },
//     "pending_jobs": { "1": { "id": 1, "resource_urn": "...", ... } },
//     "next_job_id": 2
//   }
// }
// ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use super::tables::Tables;
use super::{Store, lease_duration};
use crate::error::{Error, Result};
use crate::job::{JobOutcome, PendingJob, Schedule};
use crate::resource::{ListFilter, Resource};

/// Store file format version
const STORE_FILE_VERSION: &str = "1";

/// Serializable store file format
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    tables: Tables,
}

/// File-based store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use entropy_core::store::{FileStore, Store};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     FileStore::migrate("/var/lib/entropy/store.json").await?;
///     let store = FileStore::open("/var/lib/entropy/store.json").await?;
///
///     let resource = store.get_by_urn("orn:entropy:webhook:p1:deploy-hook").await?;
///     println!("{}", resource.state.status);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    local: Mutex<()>,
}

/// Exclusive hold on a store file, released on drop
struct StoreLock<'a> {
    _local: MutexGuard<'a, ()>,
    _file: std::fs::File,
}

impl FileStore {
    /// Open (or start empty at) the store file at `path`
    ///
    /// Tries the main file first, then the backup if the main file is
    /// corrupt. A missing file yields an empty store that is created on
    /// the first write.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::ensure_parent(&path).await?;

        let store = Self {
            path,
            local: Mutex::new(()),
        };
        let tables = {
            let _lock = store.lock().await?;
            Self::load_with_recovery(&store.path).await?
        };
        tracing::debug!(
            path = %store.path.display(),
            resources = tables.resource_count(),
            jobs = tables.job_count(),
            "store opened"
        );
        Ok(store)
    }

    /// Create the store file with an empty image if it does not exist
    pub async fn migrate<P: AsRef<Path>>(path: P) -> Result<()> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            local: Mutex::new(()),
        };
        Self::ensure_parent(&store.path).await?;
        let _lock = store.lock().await?;

        if store.path.exists() {
            // Validates the existing image (and recovers from backup if needed)
            let tables = Self::load_with_recovery(&store.path).await?;
            Self::write_image(&store.path, &tables).await?;
            tracing::info!(path = %store.path.display(), "store file up to date");
            return Ok(());
        }

        Self::write_image(&store.path, &Tables::new()).await?;
        tracing::info!(path = %store.path.display(), "store file created");
        Ok(())
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Take the in-process mutex, then the OS lock on the `.lock` file
    async fn lock(&self) -> Result<StoreLock<'_>> {
        let local = self.local.lock().await;
        let lock_path = Self::lock_path(&self.path);

        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)
                .map_err(|e| {
                    Error::store(format!("Failed to open lock file {}: {}", lock_path.display(), e))
                })?;
            file.lock().map_err(|e| {
                Error::store(format!("Failed to lock {}: {}", lock_path.display(), e))
            })?;
            Ok::<_, Error>(file)
        })
        .await
        .map_err(|e| Error::internal(format!("store lock task failed: {e}")))??;

        Ok(StoreLock {
            _local: local,
            _file: file,
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<Tables> {
        match Self::load(path).await {
            Ok(tables) => Ok(tables),
            Err(LoadError::Corrupt(e)) => {
                tracing::warn!(
                    "Store file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    return Err(Error::store(format!(
                        "store file {} is corrupted and no backup exists: {}",
                        path.display(),
                        e
                    )));
                }

                match Self::load(&backup_path).await {
                    Ok(tables) => {
                        tracing::info!(
                            "Recovered store from backup: {} resources",
                            tables.resource_count()
                        );
                        fs::copy(&backup_path, path).await.map_err(|e| {
                            Error::store(format!(
                                "Failed to restore {} from backup: {}",
                                path.display(),
                                e
                            ))
                        })?;
                        Ok(tables)
                    }
                    Err(LoadError::Corrupt(backup_err)) | Err(LoadError::Io(backup_err)) => {
                        Err(Error::store(format!(
                            "store file and backup are both unreadable: {e}; {backup_err}"
                        )))
                    }
                }
            }
            Err(LoadError::Io(e)) => Err(e),
        }
    }

    async fn load(path: &Path) -> std::result::Result<Tables, LoadError> {
        if !path.exists() {
            tracing::trace!("Store file does not exist: {}", path.display());
            return Ok(Tables::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadError::Io(Error::store(format!(
                "Failed to read store file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content).map_err(|e| {
            LoadError::Corrupt(Error::store(format!(
                "Failed to parse store file {}: {}",
                path.display(),
                e
            )))
        })?;

        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }

        let mut tables = file.tables;
        tables.reindex().map_err(LoadError::Corrupt)?;
        Ok(tables)
    }

    /// Write a full image atomically (temp file + rename, previous kept as backup)
    async fn write_image(path: &Path, tables: &Tables) -> Result<()> {
        let image = StoreFileFormat {
            version: STORE_FILE_VERSION.to_string(),
            tables: tables.clone(),
        };
        let json = serde_json::to_vec_pretty(&image)?;

        let temp_path = Self::temp_path(path);
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(&json).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if path.exists()
            && let Err(e) = fs::copy(path, Self::backup_path(path)).await
        {
            tracing::warn!("Failed to create store backup: {}", e);
        }

        fs::rename(&temp_path, path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::trace!("Store image written to {}", path.display());
        Ok(())
    }

    /// Run `f` against the current on-disk image
    async fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T>) -> Result<T> {
        let _lock = self.lock().await?;
        let tables = Self::load_with_recovery(&self.path).await?;
        f(&tables)
    }

    /// Apply `f` to the current on-disk image and persist the result
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Tables, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.lock().await?;
        let mut tables = Self::load_with_recovery(&self.path).await?;
        let out = f(&mut tables, Utc::now())?;
        Self::write_image(&self.path, &tables).await?;
        Ok(out)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut temp = path.to_path_buf();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut lock = path.to_path_buf();
        lock.set_extension("lock");
        lock
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Load failures, split so only corruption triggers backup recovery
enum LoadError {
    Corrupt(Error),
    Io(Error),
}

#[async_trait]
impl Store for FileStore {
    async fn create(&self, resource: Resource, schedule: Option<Schedule>) -> Result<Resource> {
        self.mutate(|t, now| t.create(resource, schedule, now)).await
    }

    async fn get_by_urn(&self, urn: &str) -> Result<Resource> {
        self.read(|t| t.get(urn)).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Resource>> {
        self.read(|t| Ok(t.list(filter))).await
    }

    async fn update_state(
        &self,
        urn: &str,
        expected_version: u64,
        resource: Resource,
        schedule: Option<Schedule>,
    ) -> Result<Resource> {
        self.mutate(|t, now| t.update_state(urn, expected_version, resource, schedule, now))
            .await
    }

    async fn enqueue(&self, urn: &str, run_at: DateTime<Utc>) -> Result<PendingJob> {
        self.mutate(|t, _| t.enqueue(urn, run_at)).await
    }

    async fn pending_job(&self, urn: &str) -> Result<Option<PendingJob>> {
        self.read(|t| Ok(t.pending_job(urn))).await
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(PendingJob, Resource)>> {
        let ttl = lease_duration(lease_ttl)?;

        let _lock = self.lock().await?;
        let mut tables = Self::load_with_recovery(&self.path).await?;
        let now = Utc::now();

        // Idle polls must not rewrite the file
        if tables.peek_ready(now).is_none() {
            return Ok(None);
        }
        let claimed = tables.dequeue(worker_id, ttl, now)?;
        Self::write_image(&self.path, &tables).await?;
        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        job_id: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<PendingJob> {
        let ttl = lease_duration(ttl)?;
        self.mutate(|t, now| t.extend_lease(job_id, worker_id, ttl, now))
            .await
    }

    async fn release_lease(&self, job_id: u64, worker_id: &str) -> Result<()> {
        self.mutate(|t, _| {
            t.release_lease(job_id, worker_id);
            Ok(())
        })
        .await
    }

    async fn finish_job(
        &self,
        job_id: u64,
        worker_id: &str,
        outcome: JobOutcome,
        resource: Resource,
    ) -> Result<Resource> {
        self.mutate(|t, now| t.finish_job(job_id, worker_id, outcome, resource, now))
            .await
    }

    /// Every mutation is on disk before it returns; this only makes sure
    /// the file exists
    async fn flush(&self) -> Result<()> {
        let _lock = self.lock().await?;
        if !self.path.exists() {
            Self::write_image(&self.path, &Tables::new()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Spec, Status};
    use tempfile::tempdir;

    fn resource(name: &str) -> Resource {
        Resource::new("log", "p1", name, Spec::default())
    }

    #[tokio::test]
    async fn test_file_store_persists_resources_and_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).await.unwrap();
        store
            .create(resource("a"), Some(Schedule::at(Utc::now())))
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = FileStore::open(&path).await.unwrap();
        let res = reopened.get_by_urn("orn:entropy:log:p1:a").await.unwrap();
        assert_eq!(res.state.status, Status::Pending);
        assert!(
            reopened
                .pending_job("orn:entropy:log:p1:a")
                .await
                .unwrap()
                .is_some()
        );

        // Job ids keep increasing across restarts
        reopened
            .create(resource("b"), Some(Schedule::at(Utc::now())))
            .await
            .unwrap();
        let b_job = reopened
            .pending_job("orn:entropy:log:p1:b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b_job.id, 2);
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).await.unwrap();
        store.create(resource("a"), None).await.unwrap();
        // Second write creates the backup holding only "a"
        store.create(resource("b"), None).await.unwrap();

        let backup_path = FileStore::backup_path(&path);
        assert!(backup_path.exists(), "Backup file should exist after write");

        fs::write(&path, b"corrupted json data").await.unwrap();

        let recovered = FileStore::open(&path).await.unwrap();
        assert!(recovered.get_by_urn("orn:entropy:log:p1:a").await.is_ok());
        assert!(
            recovered.get_by_urn("orn:entropy:log:p1:b").await.is_err(),
            "Backup should contain previous image, not latest"
        );
    }

    #[tokio::test]
    async fn test_two_instances_share_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let api = FileStore::open(&path).await.unwrap();
        let worker = FileStore::open(&path).await.unwrap();

        api.create(resource("a"), Some(Schedule::at(Utc::now())))
            .await
            .unwrap();

        let (job, res) = worker
            .dequeue("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job created through the other instance");
        assert_eq!(res.urn, "orn:entropy:log:p1:a");

        worker.create(resource("b"), None).await.unwrap();

        // Neither instance's write erased the other's rows
        let reopened = FileStore::open(&path).await.unwrap();
        assert!(reopened.get_by_urn("orn:entropy:log:p1:a").await.is_ok());
        assert!(reopened.get_by_urn("orn:entropy:log:p1:b").await.is_ok());
        let claimed = reopened
            .pending_job("orn:entropy:log:p1:a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));

        // The lease taken through one instance is enforced through the other
        let err = api
            .update_state("orn:entropy:log:p1:a", res.version, res.clone(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_concurrent_instances_never_lose_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut handles = Vec::new();
        for i in 0..4 {
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let store = FileStore::open(&path).await.unwrap();
                for j in 0..5 {
                    store
                        .create(resource(&format!("r{i}-{j}")), None)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.list(&ListFilter::default()).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_migrate_creates_empty_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        FileStore::migrate(&path).await.unwrap();
        assert!(path.exists());

        let store = FileStore::open(&path).await.unwrap();
        assert!(store.list(&ListFilter::default()).await.unwrap().is_empty());

        // Idempotent
        FileStore::migrate(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).await.unwrap();
        store.create(resource("a"), None).await.unwrap();
        assert!(store.create(resource("a"), None).await.is_err());

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(&ListFilter::default()).await.unwrap().len(), 1);
    }
}
