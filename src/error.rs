//! Error types for torns

use crate::types::ResolveStatus;
use thiserror::Error;

/// Errors that can occur in the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No configured plugin handles this name (pass-through, not a failure)
    #[error("No name service configured for '{0}'")]
    NoService(String),

    /// Spawning the plugin process failed
    #[error("Failed to launch plugin for suffix '{suffix}': {reason}")]
    PluginLaunch {
        suffix: String,
        reason: String,
    },

    /// The plugin's pipes have closed; the link no longer accepts queries
    #[error("Plugin link for suffix '{0}' is closed")]
    LinkClosed(String),

    /// Unparseable plugin line or a request that cannot be encoded
    #[error("Plugin protocol error: {0}")]
    PluginProtocol(String),

    /// Terminal resolution failure reported by a plugin
    #[error("Name resolution failed: {0}")]
    Resolution(ResolveStatus),

    /// Controller refused the request because the stream is gone or unsatisfiable
    #[error("Controller rejected request: {0}")]
    ControllerRejected(String),

    /// Any other controller error reply
    #[error("Controller error {code}: {message}")]
    Controller {
        code: u16,
        message: String,
    },

    /// Control port connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether the controller refused a request for a stream that may have vanished
    pub fn is_rejection(&self) -> bool {
        matches!(self, BrokerError::ControllerRejected(_))
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
