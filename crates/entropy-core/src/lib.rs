// # entropy-core
//
// Reconciliation engine for declaratively managed infrastructure resources.
//
// ## Architecture Overview
//
// - **Resource**: desired spec, observed state and the single pending
//   next action of one managed object
// - **Store**: resources plus the pending-job table that serves as the
//   work queue, updated in atomic transitions
// - **Module**: per-kind plugin implementing plan / sync / output, and
//   optionally log streaming
// - **ModuleRegistry**: kind -> module descriptor, immutable after startup
// - **ResourceService**: command and query path used by transport adapters
// - **Syncer**: worker pool executing due steps under leases, with retries
//   and backoff
// - **Gateway / Client**: HTTP routes (axum) and their reqwest client
//
// ## Design Principles
//
// 1. **Store is the source of truth**: workers coordinate only through
//    job leases, never through shared memory
// 2. **At-least-once steps**: module `sync` must be idempotent
// 3. **Opaque module state**: the core transports configs, params, output
//    and module data without interpreting them
// 4. **Explicit wiring**: no globals; handles are passed at construction

pub mod config;
pub mod error;
pub mod job;
pub mod module;
pub mod registry;
pub mod resource;
pub mod service;
pub mod store;
pub mod syncer;
pub mod transport;

// Re-export core types for convenience
pub use config::{EntropyConfig, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use job::{JobOutcome, PendingJob, Schedule};
pub use module::{ActionRequest, LogChunk, LogFilter, Loggable, Module, ModuleContext};
pub use registry::{ActionDesc, ModuleDescriptor, ModuleRegistry};
pub use resource::{ListFilter, NextAction, Resource, Spec, State, Status};
pub use service::{CreateRequest, ResourceService, UpdateRequest};
pub use store::{FileStore, MemoryStore, Store};
pub use syncer::{Syncer, SyncerHandle};
pub use transport::{Client, Gateway};
