//! Configuration types for the reconciliation engine
//!
//! One serde tree covers the service, the store, the worker pool and the
//! syncer budgets. Every field has a default so a partial JSON file (or
//! none at all) yields a runnable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the JSON config file
pub const CONFIG_ENV: &str = "ENTROPY_CONFIG";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntropyConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Legacy Postgres connection string; not supported by this build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_conn_str: Option<String>,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub syncer: SyncerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl EntropyConfig {
    /// Load configuration from a JSON file and `ENTROPY_*` overrides
    ///
    /// The file is `path` if given, else `$ENTROPY_CONFIG` if set. Without
    /// either, defaults are used. The result is not validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: Option<PathBuf> = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Apply `ENTROPY_*` overrides resolved through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("ENTROPY_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(host) = lookup("ENTROPY_SERVICE_HOST") {
            self.service.host = host;
        }
        if let Some(port) = lookup("ENTROPY_SERVICE_PORT") {
            self.service.port = parse_override("ENTROPY_SERVICE_PORT", &port)?;
        }
        if let Some(path) = lookup("ENTROPY_STORE_PATH") {
            self.store = StoreConfig::File { path };
        }
        if let Some(threads) = lookup("ENTROPY_WORKER_THREADS") {
            self.worker.threads = parse_override("ENTROPY_WORKER_THREADS", &threads)?;
        }
        if let Some(ms) = lookup("ENTROPY_WORKER_POLL_INTERVAL_MS") {
            self.worker.poll_interval_ms = parse_override("ENTROPY_WORKER_POLL_INTERVAL_MS", &ms)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pg_conn_str.is_some() {
            return Err(Error::config(
                "pg_conn_str is not supported; configure store = { \"type\": \"file\", \"path\": ... }",
            ));
        }

        self.log.level()?;
        self.service.validate()?;
        self.store.validate()?;
        self.worker.validate()?;
        self.syncer.validate()?;

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}='{value}' is invalid: {e}")))
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LogConfig {
    /// Parsed tracing level
    pub fn level(&self) -> Result<tracing::Level> {
        self.level.parse().map_err(|_| {
            Error::config(format!(
                "log.level '{}' is not supported. Use one of: trace, debug, info, warn, error",
                self.level
            ))
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// API service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Reported at startup only; no gRPC listener is started
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Upper bound on a single API request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Compare-and-swap retries before surfacing `Conflict`
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl ServiceConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("service.host cannot be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::config("service.request_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            grpc_port: default_grpc_port(),
            request_timeout_ms: default_request_timeout_ms(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_grpc_port() -> u16 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_cas_retries() -> u32 {
    3
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// JSON image on local disk
    File {
        /// Path to the store file
        path: String,
    },

    /// In-memory store (not persistent)
    Memory,
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        match self {
            StoreConfig::File { path } if path.trim().is_empty() => {
                Err(Error::config("store.path cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StoreConfig::File { .. } => "file",
            StoreConfig::Memory => "memory",
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            path: "entropy-store.json".to_string(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent sync workers
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Prefix for worker ids and log fields
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::config("worker.threads must be >= 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("worker.poll_interval_ms must be > 0"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(Error::config("worker.queue_name cannot be empty"));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_name: default_queue_name(),
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_queue_name() -> String {
    "entropy_jobs".to_string()
}

/// Syncer budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncerConfig {
    /// Deadline for one module `sync` call
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Lease refresh period; defaults to half the lease TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_ms: Option<u64>,

    /// Lease TTL granted on dequeue and on each refresh
    #[serde(default = "default_extend_lock_by_ms")]
    pub extend_lock_by_ms: u64,

    /// How long shutdown waits for in-flight steps
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl SyncerConfig {
    pub fn step_deadline(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.extend_lock_by_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(
            self.refresh_interval_ms
                .unwrap_or(self.extend_lock_by_ms / 2),
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(Error::config("syncer.sync_interval_ms must be > 0"));
        }
        if self.sync_interval_ms >= self.extend_lock_by_ms {
            return Err(Error::config(format!(
                "syncer.sync_interval_ms ({}) must be lower than syncer.extend_lock_by_ms ({})",
                self.sync_interval_ms, self.extend_lock_by_ms
            )));
        }
        if self.extend_lock_by_ms >= self.retry.cap_ms {
            return Err(Error::config(format!(
                "syncer.extend_lock_by_ms ({}) must be lower than syncer.retry.cap_ms ({})",
                self.extend_lock_by_ms, self.retry.cap_ms
            )));
        }
        let refresh = self.refresh_interval();
        if refresh.is_zero() || refresh >= self.lease_ttl() {
            return Err(Error::config(format!(
                "syncer.refresh_interval_ms ({}) must be > 0 and lower than the lease TTL",
                refresh.as_millis()
            )));
        }
        self.retry.validate()
    }
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            refresh_interval_ms: None,
            extend_lock_by_ms: default_extend_lock_by_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_extend_lock_by_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Truncated exponential backoff for failed sync steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Failed attempts after which the resource moves to ERROR
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound of the random delay added to each retry
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.base_ms == 0 {
            return Err(Error::config("syncer.retry.base_ms must be > 0"));
        }
        if self.base_ms > self.cap_ms {
            return Err(Error::config(format!(
                "syncer.retry.base_ms ({}) must not exceed syncer.retry.cap_ms ({})",
                self.base_ms, self.cap_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("syncer.retry.max_attempts must be >= 1"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_cap_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter_ms() -> u64 {
    250
}

/// Telemetry settings; accepted and logged, nothing is exported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "entropy".to_string()
}
