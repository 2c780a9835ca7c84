//! Error types and result handling for thl-server.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use thl_server::{Error, Result};
//!
//! fn open_listener() -> Result<()> {
//!     Err(Error::Config("Unsupported scheme: http".to_string()))
//! }
//!
//! match open_listener() {
//!     Ok(()) => println!("Listening"),
//!     Err(Error::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for thl-server operations.
///
/// Variants follow the failure taxonomy of the server: configuration
/// problems fail fast at construction or start, transport problems are
/// fatal to one connection or one server instance, and [`Error::Terminated`]
/// marks a deliberately closed channel rather than a failure.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: malformed endpoint, unsupported scheme,
    /// missing TLS material or missing handler references.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// I/O error on a socket or on security material files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The listening socket could not be bound.
    #[error("Bind error on {address}: {source}")]
    Bind {
        /// Address that was requested
        address: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration error (certificates, keys, protocol selection).
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS handshake failed for a single connection.
    #[error("TLS handshake error: {0}")]
    Handshake(String),

    /// The channel was closed on purpose; `accept()` will never yield again.
    #[error("Channel terminated")]
    Terminated,

    /// Operation not available in the current mode, e.g. authenticating
    /// on a plaintext channel.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Client credentials were refused.
    #[error("Authentication error: {outcome:?}")]
    Authentication {
        /// Outcome reported by the credential store
        outcome: crate::auth::AuthenticationOutcome,
    },

    /// Wire protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A connector handler task failed outside its protocol, e.g. panicked
    /// or was cancelled while being stopped.
    #[error("Handler error: {0}")]
    Handler(String),

    /// JSON serialization error when encoding or decoding frames.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Log store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

impl Error {
    /// Returns `true` when this error only signals deliberate channel
    /// termination.
    pub fn is_termination(&self) -> bool {
        matches!(self, Error::Terminated)
    }
}

/// A convenient Result type alias for thl-server operations.
///
/// This is equivalent to `std::result::Result<T, thl_server::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
