// # Webhook Module
//
// Module plugin for resources of kind `webhook`: every planned step ends in
// exactly one HTTP delivery to the configured endpoint.
//
// ## Lifecycle
//
// - `create` / `update`: deliver a `create` / `update` event, then COMPLETED
// - `delete`: deliver a `delete` event (unless `notify_on_delete` is off),
//   then DELETED
// - `redeliver`: send the last event again; allowed in COMPLETED and ERROR
//
// ## Delivery Semantics
//
// One request per `sync` call. Retries, backoff and deadlines belong to the
// syncer; a non-2xx answer is reported as an error and nothing else.
//
// Steps are executed at least once. Every request carries an
// `Idempotency-Key` header of the form `<step>@<run_at>`, identical across
// re-runs of the same step, and the key of the last delivered step is kept
// in module data so a step whose result was already recorded is not sent
// twice.
//
// ## Module Data
//
// ```json
// {
//   "delivered": "create@2026-01-01T00:00:00Z",
//   "deliveries": 3,
//   "history": [{"event": "create", "status_code": 200, "delivered_at": "...", "key": "..."}]
// }
// ```
//
// The history is bounded to the last `HISTORY_LIMIT` deliveries and is what
// `log` streams.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use entropy_core::module::{
    ActionRequest, LogChunk, LogFilter, LogStream, Loggable, Module, ModuleContext, actions,
    decode, matches_filter,
};
use entropy_core::{
    ActionDesc, Error, ModuleDescriptor, ModuleRegistry, NextAction, Resource, Result, Status,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Resource kind served by this module
pub const KIND: &str = "webhook";

/// Custom action re-sending the last event
pub const REDELIVER: &str = "redeliver";

/// Deliveries kept in module data
pub const HISTORY_LIMIT: usize = 20;

/// Upper bound for a single request when the configs do not say otherwise
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn default_method() -> String {
    "POST".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

/// Configs of a webhook resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfigs {
    /// Endpoint receiving the deliveries (http or https)
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Opaque JSON forwarded as `payload` in every delivery
    #[serde(default)]
    pub payload: Value,

    /// Send a `delete` event before the resource is removed
    #[serde(default = "default_true")]
    pub notify_on_delete: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl WebhookConfigs {
    /// Decode and check configs submitted through an API call
    fn parse(configs: &Value) -> Result<Self> {
        let parsed: Self = decode(configs)
            .map_err(|e| Error::invalid_params(format!("invalid {KIND} configs: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Decode configs of a stored resource
    fn load(configs: &Value) -> Result<Self> {
        decode(configs).map_err(|e| Error::config_parse(KIND, e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::invalid_params(format!(
                "webhook url must be http or https, got '{}'",
                self.url
            )));
        }
        if reqwest::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(Error::invalid_params(format!(
                "invalid HTTP method '{}'",
                self.method
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::invalid_params("timeout_secs must be greater than 0"));
        }
        Ok(())
    }
}

/// Params of the `redeliver` action
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedeliverParams {
    /// Replaces the configured payload for this delivery only
    #[serde(default)]
    pub payload: Option<Value>,
}

/// One completed delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub event: String,
    pub status_code: u16,
    pub delivered_at: DateTime<Utc>,
    pub key: String,
}

/// Module-owned bookkeeping kept in `state.module_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookData {
    /// Idempotence key of the last delivered step
    #[serde(default)]
    pub delivered: Option<String>,

    /// Total number of deliveries over the resource's lifetime
    #[serde(default)]
    pub deliveries: u64,

    #[serde(default)]
    pub history: Vec<Delivery>,
}

impl WebhookData {
    fn load(resource: &Resource) -> Result<Self> {
        decode(&resource.state.module_data)
            .map_err(|e| Error::internal(format!("corrupt webhook module data: {e}")))
    }

    fn record(&mut self, delivery: Delivery) {
        self.delivered = Some(delivery.key.clone());
        self.deliveries += 1;
        self.history.push(delivery);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    fn output(&self) -> Value {
        let last = self.history.last();
        json!({
            "last_status_code": last.map(|d| d.status_code),
            "last_delivered_at": last.map(|d| d.delivered_at),
            "deliveries": self.deliveries,
        })
    }
}

/// Failure of a single delivery
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

impl From<DeliveryError> for Error {
    fn from(err: DeliveryError) -> Self {
        Error::internal(err.to_string())
    }
}

/// Idempotence key of a step: its name and scheduled time
pub fn idempotence_key(action: &NextAction) -> String {
    format!(
        "{}@{}",
        action.name,
        action.run_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Webhook delivery module
#[derive(Debug, Clone)]
pub struct WebhookModule {
    client: reqwest::Client,
}

impl WebhookModule {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn deliver(
        &self,
        configs: &WebhookConfigs,
        urn: &str,
        event: &str,
        payload: &Value,
        key: &str,
    ) -> std::result::Result<u16, DeliveryError> {
        let method = reqwest::Method::from_bytes(configs.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let body = json!({
            "event": event,
            "urn": urn,
            "payload": payload,
        });

        let mut request = self
            .client
            .request(method, &configs.url)
            .timeout(Duration::from_secs(configs.timeout_secs))
            .header("Idempotency-Key", key)
            .json(&body);
        for (name, value) in &configs.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|source| DeliveryError::Transport {
            url: configs.url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(DeliveryError::Status {
                url: configs.url.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(status.as_u16())
    }
}

fn settle(next: &mut Resource, event: &str, data: &WebhookData) -> Result<()> {
    next.state.status = if event == actions::DELETE {
        Status::Deleted
    } else {
        Status::Completed
    };
    next.state.next_action = None;
    next.state.output = data.output();
    next.state.module_data = serde_json::to_value(data)?;
    Ok(())
}

#[async_trait]
impl Module for WebhookModule {
    fn plan(
        &self,
        ctx: &ModuleContext,
        resource: &Resource,
        action: &ActionRequest,
    ) -> Result<Resource> {
        let mut next = resource.clone();
        let step = match action.name.as_str() {
            actions::CREATE | actions::UPDATE | actions::DELETE => {
                WebhookConfigs::parse(&next.spec.configs)?;
                NextAction::new(&action.name, ctx.now)
            }
            REDELIVER => {
                let params: RedeliverParams = decode(&action.params)
                    .map_err(|e| Error::invalid_params(format!("redeliver: {e}")))?;
                let mut step = NextAction::new(REDELIVER, ctx.now);
                if let Some(payload) = params.payload {
                    step = step.with_params(json!({ "payload": payload }));
                }
                step
            }
            other => {
                return Err(Error::invalid_params(format!(
                    "unknown action '{other}' for kind {KIND}"
                )));
            }
        };

        next.state.status = Status::Pending;
        next.state.next_action = Some(step);
        Ok(next)
    }

    async fn sync(&self, ctx: &ModuleContext, resource: &Resource) -> Result<Resource> {
        let mut next = resource.clone();
        let Some(step) = resource.state.next_action.clone() else {
            return Ok(next);
        };

        let configs = WebhookConfigs::load(&resource.spec.configs)?;
        let mut data = WebhookData::load(resource)?;
        let key = idempotence_key(&step);
        let event = if step.name == REDELIVER {
            data.history
                .last()
                .map(|d| d.event.clone())
                .unwrap_or_else(|| actions::CREATE.to_string())
        } else {
            step.name.clone()
        };

        if data.delivered.as_deref() == Some(key.as_str()) {
            tracing::debug!(urn = %resource.urn, key = %key, "step already delivered");
            settle(&mut next, &step.name, &data)?;
            return Ok(next);
        }

        if step.name == actions::DELETE && !configs.notify_on_delete {
            tracing::debug!(urn = %resource.urn, "delete notification disabled");
            settle(&mut next, &step.name, &data)?;
            return Ok(next);
        }

        let payload = step
            .params
            .get("payload")
            .cloned()
            .unwrap_or_else(|| configs.payload.clone());
        let status_code = self
            .deliver(&configs, &resource.urn, &event, &payload, &key)
            .await?;

        tracing::info!(
            urn = %resource.urn,
            event = %event,
            status_code,
            "webhook delivered"
        );
        data.record(Delivery {
            event,
            status_code,
            delivered_at: ctx.now,
            key,
        });
        settle(&mut next, &step.name, &data)?;
        Ok(next)
    }

    fn loggable(&self) -> Option<&dyn Loggable> {
        Some(self)
    }
}

#[async_trait]
impl Loggable for WebhookModule {
    async fn log(
        &self,
        _ctx: &ModuleContext,
        resource: &Resource,
        filter: &LogFilter,
    ) -> Result<LogStream> {
        let data = WebhookData::load(resource)?;
        let chunks: Vec<Result<LogChunk>> = data
            .history
            .into_iter()
            .map(|d| {
                LogChunk::new(format!(
                    "{} {} delivered with status {}",
                    d.delivered_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    d.event,
                    d.status_code
                ))
                .with_label("event", d.event)
                .with_label("status_code", d.status_code.to_string())
                .with_label("key", d.key)
            })
            .filter(|chunk| matches_filter(chunk, filter))
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

/// Register the webhook module with a registry
///
/// Call this during initialization, before the registry is shared.
pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
    let module = WebhookModule::new()?;
    registry.register(
        ModuleDescriptor::new(KIND, Arc::new(module))
            .with_configs::<WebhookConfigs>()
            .with_action(
                ActionDesc::new(REDELIVER)
                    .with_description("send the last event again")
                    .with_params::<RedeliverParams>()
                    .allowed_in(&[Status::Completed, Status::Error]),
            ),
    )
}
