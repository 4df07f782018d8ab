use thiserror::Error;

/// Unified error type for the core crate, mirroring the error kinds in the
/// daemon's error-handling design: invalid input, out-of-scope paths,
/// transient failures, parse failures, storage failures, draining, and
/// fatal startup conditions.
#[derive(Debug, Error)]
pub enum SariError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("path is out of scope for any active root: {0}")]
    OutOfScope(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("parse failure for {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("server is draining")]
    Draining,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("search engine error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, SariError>;

/// JSON-RPC error codes from the external interface spec.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_ARGS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const NOT_INITIALIZED: i64 = -32002;
    pub const DRAINING: i64 = -32001;
    pub const INIT_FAILURE: i64 = -32000;
}

impl SariError {
    /// Maps this error onto the JSON-RPC error code used by the daemon's
    /// session layer when packing a tool result or top-level response.
    pub fn rpc_code(&self) -> i64 {
        match self {
            SariError::InvalidArgs(_) => rpc_code::INVALID_ARGS,
            SariError::OutOfScope(_) => rpc_code::INVALID_ARGS,
            SariError::Draining => rpc_code::DRAINING,
            _ => rpc_code::INTERNAL,
        }
    }

    /// Sanitizes a message for transport: fold newlines, cap length, never
    /// include a stack trace (per the propagation policy in the spec).
    pub fn sanitized_message(&self) -> String {
        let raw = self.to_string().replace(['\n', '\r'], " ");
        if raw.len() > 500 {
            raw.chars().take(500).collect()
        } else {
            raw
        }
    }
}
