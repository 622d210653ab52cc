// # Module Contract
//
// A module is the per-kind plugin that turns resource transitions into
// executable steps.
//
// - `plan`: pure and deterministic; computes the next resource and the
//   first step to run for a proposed action
// - `sync`: performs one step of external side effects; must be
//   idempotent with respect to `module_data`
// - `output`: derived, side-effect-free view for API responses
// - `Loggable::log` (optional): lazy, cancellable stream of log chunks
//
// The core never inspects `configs`, `params`, `output` or `module_data`.
// Modules that want typed access decode them with [`decode`].
//
// ## Usage
//
// ```rust,ignore
// use entropy_core::module::{ActionRequest, Module, ModuleContext};
//
// let ctx = ModuleContext::new("webhook", "alice");
// let planned = module.plan(&ctx, &resource, &ActionRequest::new("create", configs))?;
// let synced = module.sync(&ctx, &planned).await?;
// ```

mod loggable;

pub use loggable::{LogChunk, LogFilter, LogStream, Loggable, matches_filter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::resource::Resource;

/// Names of the actions every kind understands
pub mod actions {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";

    /// Standard actions, in lifecycle order
    pub const STANDARD: [&str; 3] = [CREATE, UPDATE, DELETE];
}

/// Module-scoped context handed to every module call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleContext {
    /// Kind the module is registered under
    pub kind: String,

    /// Who triggered the call (API actor or worker id)
    pub actor: String,

    /// Wall-clock time the call was issued at; modules derive `run_at`
    /// values from it instead of reading the clock
    pub now: DateTime<Utc>,
}

impl ModuleContext {
    pub fn new(kind: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::at(kind, actor, Utc::now())
    }

    pub fn at(kind: impl Into<String>, actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            actor: actor.into(),
            now,
        }
    }
}

/// A proposed transition handed to `plan`
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub name: String,
    pub params: Value,
}

impl ActionRequest {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Trait for module implementations
///
/// Implementations must be thread-safe: one instance serves every API
/// handler and every worker of the process.
///
/// Both `plan` and `sync` receive a snapshot and return a whole new
/// resource. Identity fields (urn, kind, project, name, creation metadata
/// and version) are owned by the core and restored after the call.
#[async_trait]
pub trait Module: Send + Sync {
    /// Compute the next resource for `action`
    ///
    /// The returned resource carries the new spec/state and, in
    /// `state.next_action`, the first concrete step to run (or `None` if
    /// nothing needs to happen).
    ///
    /// # Errors
    ///
    /// - `InvalidParams`: params do not fit the action
    /// - `Conflict`: action is illegal in the current status
    /// - `Internal`: anything else
    fn plan(
        &self,
        ctx: &ModuleContext,
        resource: &Resource,
        action: &ActionRequest,
    ) -> Result<Resource>;

    /// Execute `resource.state.next_action` against the outside world
    ///
    /// Returning a resource with `next_action = None` ends the job. A
    /// follow-up `next_action` is scheduled at its `run_at`.
    ///
    /// Called at least once per step: a step interrupted by a crash or an
    /// expired lease is executed again with the same input.
    async fn sync(&self, ctx: &ModuleContext, resource: &Resource) -> Result<Resource>;

    /// Derived view returned by read APIs
    fn output(&self, resource: &Resource) -> Result<Value> {
        Ok(resource.state.output.clone())
    }

    /// Log capability, if the module can stream logs
    fn loggable(&self) -> Option<&dyn Loggable> {
        None
    }
}

/// Decode an opaque JSON value into a module-owned type
///
/// `null` decodes like an empty object so all-default config types accept
/// a resource created without configs.
pub fn decode<T: DeserializeOwned>(value: &Value) -> serde_json::Result<T> {
    match value {
        Value::Null => serde_json::from_value(Value::Object(Default::default())),
        other => T::deserialize(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Configs {
        #[serde(default)]
        replicas: u32,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Strict {
        url: String,
    }

    #[test]
    fn test_decode_null_as_empty_object() {
        let configs: Configs = decode(&Value::Null).unwrap();
        assert_eq!(configs, Configs { replicas: 0 });

        let configs: Configs = decode(&serde_json::json!({ "replicas": 3 })).unwrap();
        assert_eq!(configs.replicas, 3);
    }

    #[test]
    fn test_decode_reports_missing_fields() {
        let err = decode::<Strict>(&serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
