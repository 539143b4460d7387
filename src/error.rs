//! Governor Error Types
//!
//! This module defines all error types that can occur in the governor,
//! on both the server and client side.

use crate::quota::Category;

/// Error types for governor operations
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// Invalid configuration at startup; fatal before binding
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Requested port unavailable; fatal
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed message from a connection; that connection is dropped
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single request larger than the category's total capacity
    #[error("Requested {requested} exceeds total capacity {capacity} of {category}")]
    CapacityUnsatisfiable {
        category: Category,
        requested: u64,
        capacity: u64,
    },

    /// Client-side acquire timeout; no server-side lease was created
    #[error("Acquire timed out after {waited_ms}ms")]
    AcquireTimeout { waited_ms: u64 },

    /// Client cannot reach the server; recovered via fail-open
    #[error("Resource server unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Server rejected the request (carries the server's error message)
    #[error("Request denied by server: {0}")]
    Denied(String),

    /// Underlying I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
