// # Store Tables
//
// The `resources` and `pending_jobs` tables shared by every in-process
// store implementation.
//
// Every mutator validates first and mutates last, so a returned error
// leaves the tables untouched. Implementations wrap `Tables` in a single
// writer lock, which makes each call one atomic transition.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::job::{JobOutcome, PendingJob, Schedule};
use crate::resource::{ListFilter, Resource};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    resources: BTreeMap<String, Resource>,
    pending_jobs: BTreeMap<u64, PendingJob>,
    #[serde(default)]
    next_job_id: u64,

    /// URN -> job id; rebuilt after deserialization
    #[serde(skip)]
    job_by_urn: HashMap<String, u64>,
}

impl Tables {
    pub(crate) fn new() -> Self {
        Self {
            next_job_id: 1,
            ..Self::default()
        }
    }

    /// Rebuild derived indexes and check row invariants after loading
    pub(crate) fn reindex(&mut self) -> Result<()> {
        self.job_by_urn.clear();
        for job in self.pending_jobs.values() {
            if self
                .job_by_urn
                .insert(job.resource_urn.clone(), job.id)
                .is_some()
            {
                return Err(Error::store(format!(
                    "more than one pending job for {}",
                    job.resource_urn
                )));
            }
        }
        let max_id = self.pending_jobs.keys().max().copied().unwrap_or(0);
        self.next_job_id = self.next_job_id.max(max_id + 1);
        Ok(())
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn job_count(&self) -> usize {
        self.pending_jobs.len()
    }

    pub(crate) fn create(
        &mut self,
        mut resource: Resource,
        schedule: Option<Schedule>,
        now: DateTime<Utc>,
    ) -> Result<Resource> {
        if self.resources.contains_key(&resource.urn) {
            return Err(Error::already_exists(format!(
                "resource {} already exists",
                resource.urn
            )));
        }

        resource.version = 1;
        resource.created_at = now;
        resource.updated_at = now;

        if let Some(schedule) = schedule {
            self.upsert_job(&resource.urn, schedule);
        }
        self.resources
            .insert(resource.urn.clone(), resource.clone());

        debug!(urn = %resource.urn, "resource created");
        Ok(resource)
    }

    pub(crate) fn get(&self, urn: &str) -> Result<Resource> {
        self.resources
            .get(urn)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource {urn} not found")))
    }

    pub(crate) fn list(&self, filter: &ListFilter) -> Vec<Resource> {
        self.resources
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub(crate) fn pending_job(&self, urn: &str) -> Option<PendingJob> {
        self.job_by_urn
            .get(urn)
            .and_then(|id| self.pending_jobs.get(id))
            .cloned()
    }

    /// CAS update of a resource row issued by the command path
    ///
    /// `schedule = None` means the resource has no pending work and any job
    /// row is dropped. The update is refused while a worker holds a valid
    /// lease on the resource's job.
    pub(crate) fn update_state(
        &mut self,
        urn: &str,
        expected_version: u64,
        mut resource: Resource,
        schedule: Option<Schedule>,
        now: DateTime<Utc>,
    ) -> Result<Resource> {
        let current = self
            .resources
            .get(urn)
            .ok_or_else(|| Error::not_found(format!("resource {urn} not found")))?;

        if current.version != expected_version {
            return Err(Error::StaleVersion {
                urn: urn.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        if let Some(job) = self.pending_job(urn)
            && job.is_leased(now)
        {
            return Err(Error::conflict(format!(
                "resource {urn} is being synced by {}",
                job.claimed_by.as_deref().unwrap_or("unknown")
            )));
        }

        resource.restore_identity(current);
        resource.version = current.version + 1;
        resource.updated_at = now;

        match schedule {
            Some(schedule) => {
                self.upsert_job(urn, schedule);
            }
            None => self.remove_job_for(urn),
        }
        self.resources.insert(urn.to_string(), resource.clone());

        trace!(urn, version = resource.version, "resource updated");
        Ok(resource)
    }

    /// Insert a job, or coalesce into the existing one keeping the earliest run_at
    pub(crate) fn enqueue(&mut self, urn: &str, run_at: DateTime<Utc>) -> Result<PendingJob> {
        if !self.resources.contains_key(urn) {
            return Err(Error::not_found(format!("resource {urn} not found")));
        }
        Ok(self.upsert_job(urn, Schedule::at(run_at)))
    }

    fn upsert_job(&mut self, urn: &str, schedule: Schedule) -> PendingJob {
        if let Some(id) = self.job_by_urn.get(urn).copied()
            && let Some(job) = self.pending_jobs.get_mut(&id)
        {
            if schedule.reset_attempts {
                job.run_at = schedule.run_at;
                job.attempts = 0;
                job.last_error = None;
                job.parked = false;
            } else {
                job.run_at = job.run_at.min(schedule.run_at);
            }
            return job.clone();
        }

        let id = self.next_job_id;
        self.next_job_id += 1;
        let job = PendingJob::new(id, urn, schedule.run_at);
        self.pending_jobs.insert(id, job.clone());
        self.job_by_urn.insert(urn.to_string(), id);
        job
    }

    fn remove_job_for(&mut self, urn: &str) {
        if let Some(id) = self.job_by_urn.remove(urn) {
            self.pending_jobs.remove(&id);
        }
    }

    /// Next ready job: smallest run_at, then smallest id
    pub(crate) fn peek_ready(&self, now: DateTime<Utc>) -> Option<u64> {
        self.pending_jobs
            .values()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| (job.run_at, job.id))
            .map(|job| job.id)
    }

    pub(crate) fn dequeue(
        &mut self,
        worker_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<(PendingJob, Resource)>> {
        while let Some(id) = self.peek_ready(now) {
            let Some(job) = self.pending_jobs.get(&id) else {
                break;
            };
            let Some(resource) = self.resources.get(&job.resource_urn).cloned() else {
                warn!(job_id = id, urn = %job.resource_urn, "dropping job without resource");
                let urn = job.resource_urn.clone();
                self.remove_job_for(&urn);
                continue;
            };

            let job = self
                .pending_jobs
                .get_mut(&id)
                .ok_or_else(|| Error::internal(format!("job {id} vanished during claim")))?;
            job.claim(worker_id, now, lease_ttl);

            debug!(job_id = id, urn = %job.resource_urn, worker_id, "job claimed");
            return Ok(Some((job.clone(), resource)));
        }
        Ok(None)
    }

    pub(crate) fn extend_lease(
        &mut self,
        job_id: u64,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PendingJob> {
        let job = self
            .pending_jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {job_id} not found")))?;

        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(Error::conflict(format!(
                "job {job_id} is not claimed by {worker_id}"
            )));
        }

        job.claimed_until = Some(now + ttl);
        Ok(job.clone())
    }

    pub(crate) fn release_lease(&mut self, job_id: u64, worker_id: &str) -> bool {
        match self.pending_jobs.get_mut(&job_id) {
            Some(job) if job.claimed_by.as_deref() == Some(worker_id) => {
                job.release();
                true
            }
            _ => false,
        }
    }

    /// Apply a job outcome together with the worker's resource write
    pub(crate) fn finish_job(
        &mut self,
        job_id: u64,
        worker_id: &str,
        outcome: JobOutcome,
        mut resource: Resource,
        now: DateTime<Utc>,
    ) -> Result<Resource> {
        let job = self.pending_jobs.get(&job_id).ok_or_else(|| {
            Error::conflict(format!("job {job_id} no longer exists"))
        })?;

        if !job.is_leased_by(worker_id, now) {
            return Err(Error::conflict(format!(
                "lease on job {job_id} is no longer held by {worker_id}"
            )));
        }

        let urn = job.resource_urn.clone();
        let current = self
            .resources
            .get(&urn)
            .ok_or_else(|| Error::not_found(format!("resource {urn} not found")))?;

        resource.restore_identity(current);
        resource.version = current.version + 1;
        resource.updated_at = now;

        match outcome {
            JobOutcome::Done => self.remove_job_for(&urn),
            JobOutcome::Continue { run_at } => {
                if let Some(job) = self.pending_jobs.get_mut(&job_id) {
                    job.release();
                    job.run_at = run_at;
                    job.attempts = 0;
                    job.last_error = None;
                }
            }
            JobOutcome::Retry { run_at, error } => {
                if let Some(job) = self.pending_jobs.get_mut(&job_id) {
                    job.release();
                    job.run_at = run_at;
                    job.attempts += 1;
                    job.last_error = Some(error);
                }
            }
            JobOutcome::Park { error } => {
                if let Some(job) = self.pending_jobs.get_mut(&job_id) {
                    job.release();
                    job.attempts += 1;
                    job.last_error = Some(error);
                    job.parked = true;
                }
            }
        }
        self.resources.insert(urn.clone(), resource.clone());

        trace!(job_id, urn = %urn, "job finished");
        Ok(resource)
    }
}
