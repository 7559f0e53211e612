use std::io;

use thiserror::Error;

/// Errors raised by the offload runtime and its backends.
///
/// Every variant carries the name of the operation that failed so a diagnostic printed by
/// the caller points at the offending call without a backtrace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OffloadError {
    /// Missing or invalid configuration (no mode, unknown backend, missing device index).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Size/offset outside an allocation.
    #[error("{op}: out of bounds (bytes={bytes}, offset={offset}, size={size})")]
    Bounds {
        op: &'static str,
        bytes: i64,
        offset: i64,
        size: i64,
    },

    /// Too many kernel arguments.
    #[error("{op}: argument position {position} exceeds the maximum of {max} arguments")]
    Capacity {
        op: &'static str,
        position: usize,
        max: usize,
    },

    /// A driver call or backend operation failed.
    #[error("{op}: backend failure: {message}")]
    Backend { op: &'static str, message: String },

    /// A kernel could not be launched with its current state.
    #[error("kernel {kernel}: launch error: {message}")]
    Launch { kernel: String, message: String },

    /// Kernel compilation failed.
    #[error("compile error: {message}")]
    Compile { message: String },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op}: invalid json: {source}")]
    Json {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl OffloadError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OffloadError::Configuration {
            message: message.into(),
        }
    }

    pub fn bounds(op: &'static str, bytes: i64, offset: i64, size: usize) -> Self {
        OffloadError::Bounds {
            op,
            bytes,
            offset,
            size: i64::try_from(size).unwrap_or(i64::MAX),
        }
    }

    pub fn backend(op: &'static str, message: impl Into<String>) -> Self {
        OffloadError::Backend {
            op,
            message: message.into(),
        }
    }

    pub fn launch(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        OffloadError::Launch {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        OffloadError::Compile {
            message: message.into(),
        }
    }

    pub fn io(op: &'static str, source: io::Error) -> Self {
        OffloadError::Io { op, source }
    }

    pub fn json(op: &'static str, source: serde_json::Error) -> Self {
        OffloadError::Json { op, source }
    }

    /// True for errors raised before any backend call was issued.
    pub fn is_bounds(&self) -> bool {
        matches!(self, OffloadError::Bounds { .. })
    }
}

/// Convenience alias for results returned by runtime and backend routines.
pub type OffloadResult<T> = Result<T, OffloadError>;
