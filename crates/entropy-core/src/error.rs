//! Error types for the reconciliation engine
//!
//! Every fallible operation in the crate returns [`Error`]. Transport
//! adapters never match on variants directly; they call [`Error::kind`]
//! and map the resulting [`ErrorKind`] onto their own status codes.

use std::fmt;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the reconciliation engine
#[derive(Error, Debug)]
pub enum Error {
    /// Requested resource (or job) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same identity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Request parameters failed validation
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Operation is illegal in the current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Compare-and-swap on a resource row lost the race
    #[error("conflict: resource {urn} changed (expected version {expected}, found {actual})")]
    StaleVersion {
        /// Resource URN
        urn: String,
        /// Version the caller based its change on
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Module does not support the requested capability
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No module is registered for the kind
    #[error("module not found for kind '{0}'")]
    ModuleNotFound(String),

    /// Resource configs could not be decoded by the module schema
    #[error("failed to parse configs for kind '{kind}': {message}")]
    ModuleConfigParseFailed {
        /// Resource kind
        kind: String,
        /// Decoder message
        message: String,
    },

    /// Unexpected failure (module internals, invariant breaks)
    #[error("internal error: {0}")]
    Internal(String),

    /// Persistence failure in a store implementation
    #[error("store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Surface vocabulary of errors shared by the service and its adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidParams,
    Conflict,
    Unsupported,
    ModuleNotFound,
    ModuleConfigParseFailed,
    Internal,
}

impl ErrorKind {
    /// Stable name used in logs and on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::ModuleNotFound => "module_not_found",
            ErrorKind::ModuleConfigParseFailed => "module_config_parse_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an "already exists" error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create an invalid params error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a config decoding error for a module kind
    pub fn config_parse(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleConfigParseFailed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Collapse the error onto the surface vocabulary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidParams(_) => ErrorKind::InvalidParams,
            Error::Conflict(_) | Error::StaleVersion { .. } => ErrorKind::Conflict,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::ModuleNotFound(_) => ErrorKind::ModuleNotFound,
            Error::ModuleConfigParseFailed { .. } => ErrorKind::ModuleConfigParseFailed,
            Error::Internal(_)
            | Error::Store(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// True when the error is a lost compare-and-swap that may be retried
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Error::StaleVersion { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
