// # Memory Store
//
// In-memory implementation of Store.
//
// All state is lost on restart. Useful for tests and for single-process
// deployments where resources are re-declared on boot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::tables::Tables;
use super::{Store, lease_duration};
use crate::error::Result;
use crate::job::{JobOutcome, PendingJob, Schedule};
use crate::resource::{ListFilter, Resource};

/// In-memory store implementation
///
/// A single `RwLock` guards both tables, so every mutator is atomic.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Tables::new())),
        }
    }

    /// Number of resources in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.resource_count()
    }

    /// Check if the store holds no resources
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of pending job rows
    pub async fn job_count(&self) -> usize {
        self.inner.read().await.job_count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, resource: Resource, schedule: Option<Schedule>) -> Result<Resource> {
        self.inner
            .write()
            .await
            .create(resource, schedule, Utc::now())
    }

    async fn get_by_urn(&self, urn: &str) -> Result<Resource> {
        self.inner.read().await.get(urn)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Resource>> {
        Ok(self.inner.read().await.list(filter))
    }

    async fn update_state(
        &self,
        urn: &str,
        expected_version: u64,
        resource: Resource,
        schedule: Option<Schedule>,
    ) -> Result<Resource> {
        self.inner
            .write()
            .await
            .update_state(urn, expected_version, resource, schedule, Utc::now())
    }

    async fn enqueue(&self, urn: &str, run_at: DateTime<Utc>) -> Result<PendingJob> {
        self.inner.write().await.enqueue(urn, run_at)
    }

    async fn pending_job(&self, urn: &str) -> Result<Option<PendingJob>> {
        Ok(self.inner.read().await.pending_job(urn))
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(PendingJob, Resource)>> {
        let ttl = lease_duration(lease_ttl)?;
        self.inner.write().await.dequeue(worker_id, ttl, Utc::now())
    }

    async fn extend_lease(
        &self,
        job_id: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<PendingJob> {
        let ttl = lease_duration(ttl)?;
        self.inner
            .write()
            .await
            .extend_lease(job_id, worker_id, ttl, Utc::now())
    }

    async fn release_lease(&self, job_id: u64, worker_id: &str) -> Result<()> {
        self.inner.write().await.release_lease(job_id, worker_id);
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: u64,
        worker_id: &str,
        outcome: JobOutcome,
        resource: Resource,
    ) -> Result<Resource> {
        self.inner
            .write()
            .await
            .finish_job(job_id, worker_id, outcome, resource, Utc::now())
    }

    async fn flush(&self) -> Result<()> {
        // Nothing buffered
        Ok(())
    }
}
