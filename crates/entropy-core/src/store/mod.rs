// # Resource Store
//
// Durable repository for resources plus the pending-job table that serves
// as the work queue.
//
// ## Guarantees
//
// - Every mutator is one atomic transition: an observer never sees a job
//   change without the matching resource write, or the reverse.
// - A resource has at most one pending job.
// - `dequeue` hands a ready job to exactly one worker until its lease
//   expires; afterwards another worker may claim it again.
//
// ## Implementations
//
// - `MemoryStore`: tables in process memory, for tests and ephemeral runs
// - `FileStore`: tables persisted to a JSON image with atomic replace,
//   coordinated across processes by an OS file lock

pub mod file;
pub mod memory;
mod tables;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::job::{JobOutcome, PendingJob, Schedule};
use crate::resource::{ListFilter, Resource};

/// Trait for store implementations
///
/// All methods must be safe to call concurrently from multiple tasks.
/// Implementations with shared backing storage (`FileStore`) must also
/// stay consistent across processes using the same storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new resource, optionally together with its first job
    ///
    /// Fails `AlreadyExists` when the URN is taken.
    async fn create(&self, resource: Resource, schedule: Option<Schedule>) -> Result<Resource>;

    /// Point read by URN; fails `NotFound`
    async fn get_by_urn(&self, urn: &str) -> Result<Resource>;

    /// List resources matching `filter`, ordered by URN
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Resource>>;

    /// Compare-and-swap update keyed on the resource version
    ///
    /// `schedule = Some(..)` upserts the resource's job; `None` drops it.
    /// Fails with a stale-version `Conflict` when `expected_version` no
    /// longer matches, and with `Conflict` while a worker holds a valid
    /// lease on the job.
    async fn update_state(
        &self,
        urn: &str,
        expected_version: u64,
        resource: Resource,
        schedule: Option<Schedule>,
    ) -> Result<Resource>;

    /// Insert or coalesce the pending job for `urn` (earliest run_at wins)
    ///
    /// A parked job stays parked; only a fresh schedule revives it.
    async fn enqueue(&self, urn: &str, run_at: DateTime<Utc>) -> Result<PendingJob>;

    /// The pending job row of a resource, if any
    async fn pending_job(&self, urn: &str) -> Result<Option<PendingJob>>;

    /// Claim the next ready job for `worker_id` for `lease_ttl`
    ///
    /// Tie-break: smallest `run_at`, then smallest id.
    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(PendingJob, Resource)>>;

    /// Refresh a claim; fails `Conflict` if another worker owns the job
    async fn extend_lease(&self, job_id: u64, worker_id: &str, ttl: Duration)
    -> Result<PendingJob>;

    /// Drop a claim so the job becomes reclaimable; no-op if not held
    async fn release_lease(&self, job_id: u64, worker_id: &str) -> Result<()>;

    /// Apply `outcome` to the job atomically with the resource write
    ///
    /// Fails `Conflict` without modifying anything when `worker_id` no
    /// longer holds a valid lease.
    async fn finish_job(
        &self,
        job_id: u64,
        worker_id: &str,
        outcome: JobOutcome,
        resource: Resource,
    ) -> Result<Resource>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<()>;
}

pub(crate) fn lease_duration(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| Error::invalid_params(format!("invalid lease duration {ttl:?}: {e}")))
}

/// Open the store described by `config`
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::File { path } => Ok(Arc::new(FileStore::open(path).await?)),
    }
}

/// Prepare the backing storage described by `config`
pub async fn migrate(config: &StoreConfig) -> Result<()> {
    match config {
        StoreConfig::Memory => Ok(()),
        StoreConfig::File { path } => FileStore::migrate(path).await,
    }
}
