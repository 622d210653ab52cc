//! Test doubles and common utilities for the engine contract tests
//!
//! The scripted module replays a queue of sync outcomes so tests can drive
//! the syncer through success, failure, stalls and panics deterministically.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use entropy_core::config::{RetryConfig, SyncerConfig, WorkerConfig};
use entropy_core::module::{
    ActionRequest, LogChunk, LogFilter, LogStream, Loggable, Module, ModuleContext,
    matches_filter,
};
use entropy_core::{
    CreateRequest, Error, MemoryStore, ModuleDescriptor, ModuleRegistry, NextAction, Resource,
    ResourceService, Result, Spec, Status, Store, Syncer,
};

/// One scripted `sync` outcome
#[derive(Debug, Clone)]
pub enum Step {
    /// Report RUNNING with a follow-up poll after the given delay
    Running { poll_after_ms: i64 },
    /// Reach the steady state for the current step
    Complete,
    /// Fail with an internal error
    Fail(&'static str),
    /// Sleep, then reach the steady state
    Sleep(Duration),
    /// Panic inside the module
    Panic,
    /// Return a terminal status while still scheduling work
    Inconsistent,
}

/// A module whose `sync` outcomes are scripted by the test
///
/// `create`/`update` plan an `apply` step, `delete` plans `teardown`; a
/// planned step always moves the resource back to PENDING.
/// Once the script is exhausted every step completes: `apply` ends in
/// COMPLETED, `teardown` in DELETED.
#[derive(Clone)]
pub struct ScriptedModule {
    script: Arc<Mutex<VecDeque<Step>>>,
    sync_calls: Arc<AtomicUsize>,
    plan_calls: Arc<AtomicUsize>,
    logs: Option<Arc<Vec<LogChunk>>>,
}

impl ScriptedModule {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            sync_calls: Arc::new(AtomicUsize::new(0)),
            plan_calls: Arc::new(AtomicUsize::new(0)),
            logs: None,
        }
    }

    /// Make the module `Loggable`, streaming `chunks`
    pub fn with_logs(mut self, chunks: Vec<LogChunk>) -> Self {
        self.logs = Some(Arc::new(chunks));
        self
    }

    /// Append steps to the script
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Get the number of times sync() was called
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    /// Get the number of times plan() was called
    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    fn settle(next: &mut Resource) {
        let tearing_down = next
            .state
            .next_action
            .as_ref()
            .is_some_and(|a| a.name == "teardown");
        next.state.status = if tearing_down {
            Status::Deleted
        } else {
            Status::Completed
        };
        next.state.next_action = None;
        next.state.output = serde_json::json!({ "configs": next.spec.configs });
        next.state.module_data = serde_json::json!({ "applied": next.spec.configs });
    }
}

#[async_trait]
impl Module for ScriptedModule {
    fn plan(
        &self,
        ctx: &ModuleContext,
        resource: &Resource,
        action: &ActionRequest,
    ) -> Result<Resource> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        let step = match action.name.as_str() {
            "create" | "update" => "apply",
            "delete" => "teardown",
            "noop" => return Ok(resource.clone()),
            other => return Err(Error::invalid_params(format!("unknown action {other}"))),
        };

        let mut next = resource.clone();
        next.state.status = Status::Pending;
        next.state.next_action = Some(NextAction::new(step, ctx.now));
        Ok(next)
    }

    async fn sync(&self, ctx: &ModuleContext, resource: &Resource) -> Result<Resource> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let step = { self.script.lock().unwrap().pop_front() };

        let mut next = resource.clone();
        match step {
            Some(Step::Running { poll_after_ms }) => {
                next.state.status = Status::Running;
                next.state.next_action = Some(NextAction::new(
                    "poll",
                    ctx.now + chrono::Duration::milliseconds(poll_after_ms),
                ));
            }
            Some(Step::Fail(message)) => return Err(Error::internal(message)),
            Some(Step::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Self::settle(&mut next);
            }
            Some(Step::Panic) => panic!("scripted panic"),
            Some(Step::Inconsistent) => {
                next.state.status = Status::Completed;
                next.state.next_action = Some(NextAction::new("poll", ctx.now));
            }
            Some(Step::Complete) | None => Self::settle(&mut next),
        }
        Ok(next)
    }

    fn loggable(&self) -> Option<&dyn Loggable> {
        if self.logs.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl Loggable for ScriptedModule {
    async fn log(
        &self,
        _ctx: &ModuleContext,
        _resource: &Resource,
        filter: &LogFilter,
    ) -> Result<LogStream> {
        let chunks: Vec<Result<LogChunk>> = self
            .logs
            .as_deref()
            .into_iter()
            .flatten()
            .filter(|chunk| matches_filter(chunk, filter))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

/// Registry holding `module` under kind `log`
pub fn registry_with(module: ScriptedModule) -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry
        .register(ModuleDescriptor::new("log", Arc::new(module)))
        .unwrap();
    Arc::new(registry)
}

/// Syncer budgets small enough for tests
pub fn fast_syncer_config() -> SyncerConfig {
    SyncerConfig {
        sync_interval_ms: 500,
        refresh_interval_ms: None,
        extend_lock_by_ms: 1_000,
        shutdown_grace_ms: 200,
        retry: RetryConfig {
            base_ms: 1_000,
            cap_ms: 10_000,
            max_attempts: 5,
            jitter_ms: 0,
        },
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        threads: 2,
        poll_interval_ms: 20,
        queue_name: "test_jobs".to_string(),
    }
}

/// A wired engine over a memory store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ModuleRegistry>,
    pub service: ResourceService,
    pub module: ScriptedModule,
}

impl Harness {
    pub fn new(module: ScriptedModule) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(module.clone());
        let service = ResourceService::new(store.clone(), Arc::clone(&registry));
        Self {
            store,
            registry,
            service,
            module,
        }
    }

    pub fn syncer(&self, config: SyncerConfig) -> Syncer {
        Syncer::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            fast_worker_config(),
            config,
        )
    }

    /// Pull the resource's job forward so it is ready now
    pub async fn make_due(&self, urn: &str) {
        self.store.enqueue(urn, Utc::now()).await.unwrap();
    }
}

pub fn create_request(name: &str) -> CreateRequest {
    CreateRequest {
        kind: "log".to_string(),
        project: "p1".to_string(),
        name: name.to_string(),
        labels: BTreeMap::new(),
        spec: Spec {
            configs: serde_json::json!({}),
            ..Spec::default()
        },
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
