//! Error types for the telemetry gateway.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context for operator-facing diagnostics.
//!
//! ## Error Categories
//!
//! - **Startup Errors**: malformed protocol definitions, unknown decode
//!   methods, unresolvable references, unreadable config files. These abort
//!   process startup; a gateway never runs with a partially valid protocol.
//! - **Per-Connection Errors**: wire data that does not match the compiled
//!   plan, decode-function failures, timeouts, disconnects and whitelist
//!   rejections. These close one connection and leave the rest of the
//!   process untouched.
//!
//! ## Classification
//!
//! ```rust
//! use trackside::GatewayError;
//!
//! let error = GatewayError::UnresolvedVariable { name: "frame_len".into() };
//! assert!(error.is_connection_fatal());
//! assert!(!error.is_startup_fatal());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("unknown chunk type '{name}'")]
    UnknownChunkType { name: String },

    #[error("unknown decode method '{method}' in section '{section}'")]
    UnknownDecodeMethod { method: String, section: String },

    #[error("reference '${{{name}}}' is never exported by any section")]
    UnresolvedExport { name: String },

    #[error("protocol definition error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("config file error: {path}")]
    Config {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("variable '{name}' not yet produced in frame context")]
    UnresolvedVariable { name: String },

    #[error("section '{section}' overruns chunk buffer: cursor {cursor} + {requested} > {available}")]
    CursorOverrun { section: String, cursor: usize, requested: usize, available: usize },

    #[error("decode method '{method}' failed in section '{section}'")]
    DecodeFailed {
        method: String,
        section: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("section '{section}' produced {got} values, {wanted} required")]
    ValueCount { section: String, wanted: usize, got: usize },

    #[error("type conversion error: {details}")]
    TypeConversion { details: String },

    #[error("no choice matches condition field '{field}' = '{value}'")]
    UnknownChoice { field: String, value: String },

    #[error("condition field '{field}' not set before conditional chunk")]
    ConditionNotSet { field: String },

    #[error("idle read deadline of {timeout:?} expired")]
    IdleTimeout { timeout: Duration },

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("stream ended mid-frame, {wanted} bytes expected")]
    UnexpectedEof { wanted: usize },

    #[error("connection from {addr} rejected: no device alias configured")]
    WhitelistRejected { addr: String },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    /// Returns whether this error must abort process startup.
    ///
    /// Compiler and config errors are never tolerated at runtime; a plan
    /// either compiles completely or the process does not come up.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::UnknownChunkType { .. }
                | GatewayError::UnknownDecodeMethod { .. }
                | GatewayError::UnresolvedExport { .. }
                | GatewayError::Protocol { .. }
                | GatewayError::Config { .. }
        )
    }

    /// Returns whether this error closes the owning connection only.
    ///
    /// Everything that can go wrong while executing a compiled plan against
    /// live wire data lands here; sibling connections keep running.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::UnresolvedVariable { .. }
                | GatewayError::CursorOverrun { .. }
                | GatewayError::DecodeFailed { .. }
                | GatewayError::ValueCount { .. }
                | GatewayError::TypeConversion { .. }
                | GatewayError::UnknownChoice { .. }
                | GatewayError::ConditionNotSet { .. }
                | GatewayError::IdleTimeout { .. }
                | GatewayError::PeerDisconnected
                | GatewayError::UnexpectedEof { .. }
                | GatewayError::WhitelistRejected { .. }
                | GatewayError::Io { .. }
        )
    }

    /// Returns whether this error is a clean end-of-stream from the peer.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, GatewayError::PeerDisconnected)
    }

    /// Helper constructor for protocol definition errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        GatewayError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for config file errors with path context.
    pub fn config(
        path: impl AsRef<Path>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        GatewayError::Config { path: path.as_ref().to_path_buf(), source: Box::new(source) }
    }

    /// Helper constructor for I/O errors with operation context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GatewayError::Io { context: context.into(), source }
    }

    /// Helper constructor for unresolved execution-time references.
    pub fn unresolved_variable(name: impl Into<String>) -> Self {
        GatewayError::UnresolvedVariable { name: name.into() }
    }
}
