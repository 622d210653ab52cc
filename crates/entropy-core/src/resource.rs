//! Resource data model
//!
//! A [`Resource`] is the unit of reconciliation. It carries the desired
//! [`Spec`], the observed [`State`] (including the single pending
//! [`NextAction`]) and bookkeeping metadata.
//!
//! `configs`, `output`, `module_data` and action `params` are opaque
//! `serde_json::Value`s: the core only transports them, the owning module
//! owns their schema.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// URN scheme prefix shared by every resource
pub const URN_PREFIX: &str = "orn:entropy";

/// Build the URN for a resource identity
///
/// Format: `orn:entropy:<kind>:<project>:<name>`.
pub fn generate_urn(kind: &str, project: &str, name: &str) -> String {
    format!("{URN_PREFIX}:{kind}:{project}:{name}")
}

/// Split a URN back into `(kind, project, name)`
pub fn parse_urn(urn: &str) -> Result<(String, String, String)> {
    let rest = urn
        .strip_prefix(URN_PREFIX)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or_else(|| Error::invalid_params(format!("invalid urn '{urn}'")))?;

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        [kind, project, name] if !kind.is_empty() && !project.is_empty() && !name.is_empty() => {
            Ok((kind.to_string(), project.to_string(), name.to_string()))
        }
        _ => Err(Error::invalid_params(format!("invalid urn '{urn}'"))),
    }
}

/// Validate one identity segment (kind, project or name)
pub fn validate_identity_part(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_params(format!("{field} cannot be empty")));
    }
    if value.len() > 128 {
        return Err(Error::invalid_params(format!(
            "{field} too long: {} chars (max 128)",
            value.len()
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::invalid_params(format!(
            "{field} '{value}' contains invalid characters. Valid: alphanumeric, '-', '_', '.'"
        )));
    }
    Ok(())
}

/// Observed status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Error,
    Deleted,
}

impl Status {
    /// Terminal statuses never carry a pending next action
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Error => "ERROR",
            Status::Deleted => "DELETED",
        }
    }

    /// Every status, in lifecycle order
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Running,
        Status::Completed,
        Status::Error,
        Status::Deleted,
    ];
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_params(format!("unknown status '{s}'")))
    }
}

/// Desired state of a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// Module-owned configuration
    #[serde(default)]
    pub configs: Value,

    /// Dependency key -> URN of another resource
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// The single step the syncer will execute next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    pub run_at: DateTime<Utc>,
}

impl NextAction {
    pub fn new(name: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            params: Value::Null,
            run_at,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Outcome bookkeeping of the last sync attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Consecutive failed attempts for the current step
    #[serde(default)]
    pub retries: u32,

    /// Message of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,

    /// When the current failure streak began
    #[serde(default)]
    pub first_failure_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    /// Record one more failure in the current streak
    pub fn record_failure(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.retries += 1;
        self.last_error = Some(message.into());
        if self.first_failure_at.is_none() {
            self.first_failure_at = Some(at);
        }
    }
}

/// Observed state of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub status: Status,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub module_data: Value,
    #[serde(default)]
    pub next_action: Option<NextAction>,
    #[serde(default)]
    pub sync_result: SyncResult,
}

impl Default for State {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            output: Value::Null,
            module_data: Value::Null,
            next_action: None,
            sync_result: SyncResult::default(),
        }
    }
}

/// A declaratively managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub urn: String,
    pub kind: String,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Spec,
    #[serde(default)]
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,

    /// Opaque row version for compare-and-swap updates; owned by the store
    #[serde(default)]
    pub version: u64,
}

impl Resource {
    /// Create a fresh resource with a derived URN and `PENDING` status
    pub fn new(
        kind: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
        spec: Spec,
    ) -> Self {
        let kind = kind.into();
        let project = project.into();
        let name = name.into();
        let now = Utc::now();
        Self {
            urn: generate_urn(&kind, &project, &name),
            kind,
            project,
            name,
            labels: BTreeMap::new(),
            spec,
            state: State::default(),
            created_at: now,
            updated_at: now,
            created_by: String::new(),
            updated_by: String::new(),
            version: 0,
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Check the invariants a module result must satisfy before it is persisted
    pub fn validate_state(&self) -> Result<()> {
        if self.state.status.is_terminal() && self.state.next_action.is_some() {
            return Err(Error::internal(format!(
                "resource {} reports terminal status {} with a pending next action",
                self.urn, self.state.status
            )));
        }
        Ok(())
    }

    /// Copy identity and creation metadata from `original`
    ///
    /// Modules receive and return whole resources; the fields restored here
    /// are owned by the core and never change after creation.
    pub fn restore_identity(&mut self, original: &Resource) {
        self.urn = original.urn.clone();
        self.kind = original.kind.clone();
        self.project = original.project.clone();
        self.name = original.name.clone();
        self.created_at = original.created_at;
        self.created_by = original.created_by.clone();
        self.version = original.version;
    }
}

/// Filter for listing resources; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn matches(&self, resource: &Resource) -> bool {
        if self.project.as_ref().is_some_and(|p| p != &resource.project) {
            return false;
        }
        if self.kind.as_ref().is_some_and(|k| k != &resource.kind) {
            return false;
        }
        if self.status.is_some_and(|s| s != resource.state.status) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| resource.labels.get(k) == Some(v))
    }
}
