//! Module registry
//!
//! Maps a resource `kind` to the [`ModuleDescriptor`] that owns it. The
//! registry is filled once during startup and then shared read-only
//! (behind an `Arc`) by the resource service and the syncer.
//!
//! ## Registration
//!
//! Module crates expose a `register` function:
//!
//! ```rust,ignore
//! // In entropy-module-webhook
//! pub fn register(registry: &mut ModuleRegistry) -> entropy_core::Result<()> {
//!     registry.register(
//!         ModuleDescriptor::new("webhook", Arc::new(WebhookModule::new()?))
//!             .with_configs::<WebhookConfigs>()
//!             .with_action(ActionDesc::new("redeliver").allowed_in(&[Status::Completed])),
//!     )
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::module::{Module, actions, decode};
use crate::resource::Status;

type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

fn typed_validator<T: DeserializeOwned + 'static>() -> Validator {
    Arc::new(|value: &Value| decode::<T>(value).map(|_| ()).map_err(|e| e.to_string()))
}

/// A named action a kind accepts, with its param schema and status gate
#[derive(Clone)]
pub struct ActionDesc {
    pub name: String,
    pub description: String,
    params: Option<Validator>,
    allowed_in: Option<Vec<Status>>,
}

impl ActionDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: None,
            allowed_in: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Require params to decode into `T`
    pub fn with_params<T: DeserializeOwned + 'static>(mut self) -> Self {
        self.params = Some(typed_validator::<T>());
        self
    }

    /// Only accept the action while the resource is in one of `statuses`
    pub fn allowed_in(mut self, statuses: &[Status]) -> Self {
        self.allowed_in = Some(statuses.to_vec());
        self
    }

    fn check(&self, kind: &str, status: Status, params: &Value) -> Result<()> {
        if let Some(allowed) = &self.allowed_in
            && !allowed.contains(&status)
        {
            return Err(Error::conflict(format!(
                "action '{}' on kind '{}' is not allowed in status {}",
                self.name, kind, status
            )));
        }
        if let Some(validate) = &self.params {
            validate(params).map_err(|e| {
                Error::invalid_params(format!("invalid params for action '{}': {}", self.name, e))
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ActionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDesc")
            .field("name", &self.name)
            .field("allowed_in", &self.allowed_in)
            .field("typed_params", &self.params.is_some())
            .finish()
    }
}

/// Everything the core knows about one kind
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub kind: String,
    pub actions: Vec<ActionDesc>,
    pub driver: Arc<dyn Module>,
    configs: Option<Validator>,
}

impl ModuleDescriptor {
    pub fn new(kind: impl Into<String>, driver: Arc<dyn Module>) -> Self {
        Self {
            kind: kind.into(),
            actions: Vec::new(),
            driver,
            configs: None,
        }
    }

    /// Require `spec.configs` to decode into `T`
    pub fn with_configs<T: DeserializeOwned + 'static>(mut self) -> Self {
        self.configs = Some(typed_validator::<T>());
        self
    }

    /// Declare an action; replaces the default gate of a standard action
    pub fn with_action(mut self, action: ActionDesc) -> Self {
        self.actions.retain(|a| a.name != action.name);
        self.actions.push(action);
        self
    }

    pub fn action(&self, name: &str) -> Option<&ActionDesc> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Decode `configs` against the kind's schema
    pub fn validate_configs(&self, configs: &Value) -> Result<()> {
        match &self.configs {
            Some(validate) => validate(configs).map_err(|e| {
                Error::invalid_params(format!("invalid configs for kind '{}': {}", self.kind, e))
            }),
            None => Ok(()),
        }
    }

    /// Check that `action` is known, allowed in `status` and has valid params
    ///
    /// Standard actions are always known; custom actions must be declared.
    pub fn check_action(&self, action: &str, status: Status, params: &Value) -> Result<()> {
        match self.action(action) {
            Some(desc) => desc.check(&self.kind, status, params),
            None if actions::STANDARD.contains(&action) => Ok(()),
            None => Err(Error::invalid_params(format!(
                "kind '{}' does not support action '{}'",
                self.kind, action
            ))),
        }
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("kind", &self.kind)
            .field("actions", &self.actions)
            .field("typed_configs", &self.configs.is_some())
            .finish()
    }
}

/// Registry of module descriptors keyed by kind
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor; fails `AlreadyExists` on a duplicate kind
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if self.modules.contains_key(&descriptor.kind) {
            return Err(Error::already_exists(format!(
                "module for kind '{}' is already registered",
                descriptor.kind
            )));
        }
        tracing::debug!(kind = %descriptor.kind, "module registered");
        self.modules.insert(descriptor.kind.clone(), descriptor);
        Ok(())
    }

    /// Resolve a kind; fails `ModuleNotFound`
    pub fn get(&self, kind: &str) -> Result<&ModuleDescriptor> {
        self.modules
            .get(kind)
            .ok_or_else(|| Error::ModuleNotFound(kind.to_string()))
    }

    pub fn has_module(&self, kind: &str) -> bool {
        self.modules.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.modules.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
