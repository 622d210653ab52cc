// # Resource Service
//
// Command and query path exposed to transport adapters.
//
// Every mutation follows the same shape:
//
// 1. Resolve the module descriptor for the resource kind
// 2. Validate configs and the action against the descriptor
// 3. `Module::plan` on a snapshot
// 4. Persist the planned resource and its job in one store call
//
// Re-plans of existing resources are compare-and-swap updates keyed on the
// row version, retried a bounded number of times when a concurrent writer
// wins. The service holds no state of its own beyond its handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job::{PendingJob, Schedule};
use crate::module::{ActionRequest, LogFilter, LogStream, ModuleContext, actions};
use crate::registry::{ModuleDescriptor, ModuleRegistry};
use crate::resource::{ListFilter, Resource, Spec, validate_identity_part};
use crate::store::Store;

/// Actor recorded when the caller does not identify itself
pub const ANONYMOUS: &str = "anonymous";

/// Default bound on compare-and-swap retries
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 3;

/// Input of `create`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub kind: String,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Spec,
}

/// Input of `update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub spec: Spec,

    /// Replaces the label set when present
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Resource service
///
/// Cheap to clone; clones share the store and the registry.
#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn Store>,
    registry: Arc<ModuleRegistry>,
    max_cas_retries: u32,
}

impl ResourceService {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            store,
            registry,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Create a resource and schedule its first step
    pub async fn create(&self, req: CreateRequest, actor: &str) -> Result<Resource> {
        validate_identity_part("kind", &req.kind)?;
        validate_identity_part("project", &req.project)?;
        validate_identity_part("name", &req.name)?;

        let desc = self.registry.get(&req.kind)?;
        desc.validate_configs(&req.spec.configs)?;

        let mut draft = Resource::new(&req.kind, &req.project, &req.name, req.spec.clone())
            .with_labels(req.labels);
        draft.created_by = actor.to_string();
        draft.updated_by = actor.to_string();

        desc.check_action(actions::CREATE, draft.state.status, &draft.spec.configs)?;

        let ctx = ModuleContext::new(&desc.kind, actor);
        let action = ActionRequest::new(actions::CREATE, req.spec.configs);
        let mut planned = desc.driver.plan(&ctx, &draft, &action)?;
        planned.restore_identity(&draft);
        planned.updated_by = actor.to_string();
        planned.validate_state()?;

        let schedule = schedule_for(&planned);
        let created = self.store.create(planned, schedule).await?;

        info!(
            urn = %created.urn,
            actor,
            status = %created.state.status,
            "resource created"
        );
        self.render(desc, created)
    }

    /// Replace the spec (and optionally the labels) and re-plan
    ///
    /// Allowed on a resource in `ERROR`; the retry streak starts over.
    pub async fn update(&self, urn: &str, req: UpdateRequest, actor: &str) -> Result<Resource> {
        let params = req.spec.configs.clone();
        self.replan(urn, actor, actions::UPDATE, params, |draft| {
            draft.spec = req.spec.clone();
            if let Some(labels) = &req.labels {
                draft.labels = labels.clone();
            }
        })
        .await
    }

    /// Plan the teardown of a resource
    pub async fn delete(&self, urn: &str, actor: &str) -> Result<Resource> {
        self.replan(urn, actor, actions::DELETE, Value::Null, |_| {})
            .await
    }

    /// Plan a kind-specific action
    pub async fn apply_action(
        &self,
        urn: &str,
        action: &str,
        params: Value,
        actor: &str,
    ) -> Result<Resource> {
        if action == actions::CREATE {
            return Err(Error::invalid_params(format!(
                "action '{action}' cannot be applied to existing resource {urn}"
            )));
        }
        self.replan(urn, actor, action, params, |_| {}).await
    }

    /// Read one resource with its module-derived output
    pub async fn get(&self, urn: &str) -> Result<Resource> {
        let resource = self.store.get_by_urn(urn).await?;
        let desc = self.registry.get(&resource.kind)?;
        self.render(desc, resource)
    }

    /// List resources with their module-derived outputs
    ///
    /// Resources of unregistered kinds are returned with their stored
    /// output.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Resource>> {
        let resources = self.store.list(filter).await?;
        resources
            .into_iter()
            .map(|resource| match self.registry.get(&resource.kind) {
                Ok(desc) => self.render(desc, resource),
                Err(_) => {
                    warn!(urn = %resource.urn, kind = %resource.kind, "no module for kind");
                    Ok(resource)
                }
            })
            .collect()
    }

    /// Stream logs from a `Loggable` module; `Unsupported` otherwise
    pub async fn get_log(&self, urn: &str, filter: &LogFilter) -> Result<LogStream> {
        let resource = self.store.get_by_urn(urn).await?;
        let desc = self.registry.get(&resource.kind)?;
        let loggable = desc.driver.loggable().ok_or_else(|| {
            Error::unsupported(format!("kind '{}' does not support logs", desc.kind))
        })?;

        let ctx = ModuleContext::new(&desc.kind, ANONYMOUS);
        loggable.log(&ctx, &resource, filter).await
    }

    /// The pending job row of a resource, if any
    pub async fn get_pending_job(&self, urn: &str) -> Result<Option<PendingJob>> {
        self.store.get_by_urn(urn).await?;
        self.store.pending_job(urn).await
    }

    async fn replan<F>(
        &self,
        urn: &str,
        actor: &str,
        action: &str,
        params: Value,
        apply: F,
    ) -> Result<Resource>
    where
        F: Fn(&mut Resource),
    {
        let mut attempt = 0;
        loop {
            let current = self.store.get_by_urn(urn).await?;
            let desc = self.registry.get(&current.kind)?;
            self.ensure_idle(&current).await?;
            desc.check_action(action, current.state.status, &params)?;

            let mut draft = current.clone();
            apply(&mut draft);
            if action == actions::UPDATE {
                desc.validate_configs(&draft.spec.configs)?;
            }

            let ctx = ModuleContext::new(&desc.kind, actor);
            let request = ActionRequest::new(action, params.clone());
            let mut planned = desc.driver.plan(&ctx, &draft, &request)?;
            planned.restore_identity(&current);
            planned.updated_by = actor.to_string();
            planned.state.sync_result = Default::default();
            planned.validate_state()?;

            let schedule = schedule_for(&planned);
            match self
                .store
                .update_state(urn, current.version, planned, schedule)
                .await
            {
                Ok(updated) => {
                    info!(
                        urn,
                        action,
                        actor,
                        status = %updated.state.status,
                        "resource re-planned"
                    );
                    return self.render(desc, updated);
                }
                Err(e) if e.is_stale_version() && attempt < self.max_cas_retries => {
                    attempt += 1;
                    debug!(urn, action, attempt, "concurrent write, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refuse a re-plan while the resource has unfinished work
    async fn ensure_idle(&self, resource: &Resource) -> Result<()> {
        let Some(job) = self.store.pending_job(&resource.urn).await? else {
            return Ok(());
        };

        if job.is_leased(Utc::now()) {
            return Err(Error::conflict(format!(
                "resource {} is being synced by {}",
                resource.urn,
                job.claimed_by.as_deref().unwrap_or("a worker")
            )));
        }
        if !job.parked {
            return Err(Error::conflict(format!(
                "resource {} has a pending step (status {})",
                resource.urn, resource.state.status
            )));
        }
        Ok(())
    }

    fn render(&self, desc: &ModuleDescriptor, mut resource: Resource) -> Result<Resource> {
        resource.state.output = desc.driver.output(&resource)?;
        Ok(resource)
    }
}

/// A freshly planned step starts a new attempt streak
fn schedule_for(resource: &Resource) -> Option<Schedule> {
    resource
        .state
        .next_action
        .as_ref()
        .map(|action| Schedule::fresh(action.run_at))
}
