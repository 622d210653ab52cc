// # Syncer
//
// Pool of workers that drive resources toward their desired state.
//
// Each worker repeatedly:
//
// 1. Claims the next ready job (`Store::dequeue`), or sleeps for the poll
//    interval when there is none
// 2. Keeps the lease alive from a background task while the step runs
// 3. Runs `Module::sync` under the per-step deadline
// 4. Finishes the job atomically with the new resource state:
//    - no follow-up: job deleted
//    - follow-up: job rescheduled at its `run_at`, attempts reset
//    - failure: truncated exponential backoff with jitter; after
//      `max_attempts` the resource moves to ERROR and the job is parked
//
// ## Cancellation
//
// Shutdown stops claiming new jobs and waits for in-flight steps up to the
// grace period. Steps still running after that are aborted and their
// leases released, so another worker can pick them up immediately.
//
// A panicking step is logged and recorded as a failed attempt, so it
// backs off like any other failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, SyncerConfig, WorkerConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::job::{JobOutcome, PendingJob};
use crate::module::ModuleContext;
use crate::registry::ModuleRegistry;
use crate::resource::{Resource, Status};
use crate::store::Store;

/// Delay before retry number `attempts + 1`: `min(base * 2^attempts, cap)`
pub fn backoff_delay(retry: &RetryConfig, attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    let delay = retry.base_ms.saturating_mul(factor).min(retry.cap_ms);
    Duration::from_millis(delay)
}

fn jitter(retry: &RetryConfig) -> Duration {
    if retry.jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=retry.jitter_ms))
}

/// Worker pool driving the job queue
pub struct Syncer {
    store: Arc<dyn Store>,
    registry: Arc<ModuleRegistry>,
    worker: WorkerConfig,
    config: SyncerConfig,
}

impl Syncer {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ModuleRegistry>,
        worker: WorkerConfig,
        config: SyncerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            worker,
            config,
        }
    }

    /// Spawn `worker.threads` workers
    pub fn start(self) -> SyncerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = self.config.shutdown_grace();
        let threads = self.worker.threads.max(1);
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| std::process::id().to_string());
        let syncer = Arc::new(self);

        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let worker_id = format!("{}-{}-{}", syncer.worker.queue_name, host, n);
            let syncer = Arc::clone(&syncer);
            let rx = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                syncer.worker_loop(worker_id, rx).await;
            }));
        }

        info!(
            threads,
            queue = %syncer.worker.queue_name,
            lease_ttl_ms = syncer.config.extend_lock_by_ms,
            step_deadline_ms = syncer.config.sync_interval_ms,
            "syncer started"
        );

        SyncerHandle {
            shutdown_tx,
            workers,
            grace,
        }
    }

    /// Claim and process at most one job as `worker_id`
    ///
    /// Returns whether a job was claimed.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        let (_never, rx) = watch::channel(false);
        match self
            .store
            .dequeue(worker_id, self.config.lease_ttl())
            .await?
        {
            Some((job, resource)) => {
                self.process(worker_id, job, resource, rx).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id = %worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .store
                .dequeue(&worker_id, self.config.lease_ttl())
                .await
            {
                Ok(Some((job, resource))) => {
                    self.process(&worker_id, job, resource, shutdown.clone())
                        .await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker_id = %worker_id, error = %e, "dequeue failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.worker.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(worker_id = %worker_id, "worker stopped");
    }

    async fn process(
        &self,
        worker_id: &str,
        job: PendingJob,
        resource: Resource,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let urn = resource.urn.clone();
        let step = resource
            .state
            .next_action
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_default();
        debug!(
            worker_id,
            job_id = job.id,
            urn = %urn,
            step = %step,
            attempts = job.attempts,
            "processing job"
        );

        let extender = self.spawn_lease_extender(job.id, worker_id);

        let deadline = self.config.step_deadline();
        let driver = self
            .registry
            .get(&resource.kind)
            .map(|desc| Arc::clone(&desc.driver));
        let ctx = ModuleContext::new(&resource.kind, worker_id);
        let snapshot = resource.clone();

        let mut task: JoinHandle<Result<Resource>> = tokio::spawn(async move {
            let driver = driver?;
            match tokio::time::timeout(deadline, driver.sync(&ctx, &snapshot)).await {
                Ok(result) => result,
                Err(_) => Err(Error::internal(format!(
                    "sync step exceeded deadline of {}ms",
                    deadline.as_millis()
                ))),
            }
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = shutdown_requested(&mut shutdown) => {
                info!(worker_id, urn = %urn, "shutdown requested, waiting for in-flight step");
                match tokio::time::timeout(self.config.shutdown_grace(), &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        extender.abort();
                        warn!(worker_id, urn = %urn, "step cancelled after grace period");
                        self.release(job.id, worker_id).await;
                        return;
                    }
                }
            }
        };
        extender.abort();

        let result = joined.unwrap_or_else(|e| {
            error!(worker_id, urn = %urn, error = %e, "sync step panicked");
            Err(Error::internal(format!("sync step panicked: {e}")))
        });

        let (outcome, next) = match result.and_then(|next| accept(&resource, next)) {
            Ok(next) => success_outcome(next),
            Err(e) => self.failure_outcome(&job, resource, &e),
        };

        match self.store.finish_job(job.id, worker_id, outcome, next).await {
            Ok(saved) => debug!(
                worker_id,
                urn = %urn,
                status = %saved.state.status,
                "job finished"
            ),
            Err(e) if e.kind() == ErrorKind::Conflict => {
                warn!(worker_id, urn = %urn, error = %e, "lease lost, step result discarded");
            }
            Err(e) => error!(worker_id, urn = %urn, error = %e, "failed to finish job"),
        }
    }

    fn failure_outcome(
        &self,
        job: &PendingJob,
        mut resource: Resource,
        err: &Error,
    ) -> (JobOutcome, Resource) {
        let now = Utc::now();
        let message = err.to_string();
        let attempts = job.attempts + 1;
        resource.state.sync_result.record_failure(&message, now);

        if attempts >= self.config.retry.max_attempts {
            warn!(
                urn = %resource.urn,
                attempts,
                error = %message,
                "giving up, resource moved to ERROR"
            );
            resource.state.status = Status::Error;
            resource.state.next_action = None;
            return (JobOutcome::Park { error: message }, resource);
        }

        let delay = backoff_delay(&self.config.retry, job.attempts) + jitter(&self.config.retry);
        let run_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(action) = resource.state.next_action.as_mut() {
            action.run_at = run_at;
        }
        info!(
            urn = %resource.urn,
            attempts,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %message,
            "sync failed, retrying"
        );
        (
            JobOutcome::Retry {
                run_at,
                error: message,
            },
            resource,
        )
    }

    fn spawn_lease_extender(&self, job_id: u64, worker_id: &str) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker_id = worker_id.to_string();
        let every = self.config.refresh_interval();
        let ttl = self.config.lease_ttl();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.extend_lease(job_id, &worker_id, ttl).await {
                    warn!(job_id, worker_id = %worker_id, error = %e, "failed to extend lease");
                    break;
                }
            }
        })
    }

    async fn release(&self, job_id: u64, worker_id: &str) {
        if let Err(e) = self.store.release_lease(job_id, worker_id).await {
            warn!(job_id, worker_id, error = %e, "failed to release lease");
        }
    }
}

/// Restore core-owned fields on a module result and check its invariants
fn accept(original: &Resource, mut next: Resource) -> Result<Resource> {
    next.restore_identity(original);
    next.validate_state()?;
    Ok(next)
}

fn success_outcome(mut next: Resource) -> (JobOutcome, Resource) {
    next.state.sync_result = Default::default();
    let outcome = match &next.state.next_action {
        Some(action) => JobOutcome::Continue {
            run_at: action.run_at,
        },
        None => JobOutcome::Done,
    };
    (outcome, next)
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask for shutdown anymore
            std::future::pending::<()>().await;
        }
    }
}

/// Handle to a running syncer
pub struct SyncerHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl SyncerHandle {
    /// Stop claiming jobs without waiting
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop all workers and wait for them
    ///
    /// In-flight steps get the grace period; workers are waited on a little
    /// longer so they can release leases of aborted steps.
    pub async fn shutdown(self) {
        self.request_shutdown();
        let limit = self.grace + Duration::from_secs(5);
        for worker in self.workers {
            match tokio::time::timeout(limit, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "worker terminated abnormally"),
                Err(_) => warn!("worker did not stop in time"),
            }
        }
        info!("syncer stopped");
    }
}
