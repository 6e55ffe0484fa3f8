//! Error types for KeyBridge.

use std::time::Duration;

use uuid::Uuid;

use crate::device::DeviceState;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device transport and state errors.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The communication interface could not be exclusively acquired.
    /// Distinct from absence: the device is present but unusable.
    #[error("Device claim failed: {reason}")]
    ClaimFailed { reason: String },

    #[error("Device not available for operations (state: {state})")]
    Unavailable { state: DeviceState },

    /// The device detached while an operation was in flight.
    #[error("Device disconnected during operation")]
    Disconnected,

    #[error("Device operation {method} failed: {reason}")]
    Operation { method: String, reason: String },
}

/// Approval queue errors, surfaced to whichever caller is waiting on a
/// pending request.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Request rejected by user")]
    Rejected { reason: Option<String> },

    #[error("Request cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("No decision within {timeout:?}")]
    DecisionTimeout { timeout: Duration },

    #[error("Device did not become available within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Approval queue full: {size}/{max}")]
    QueueFull { size: usize, max: usize },

    #[error("No pending request with id {id}")]
    NotFound { id: Uuid },

    /// The queue (or its executor) went away before delivering an outcome.
    #[error("Approval queue closed before the request was resolved")]
    Closed,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Pairing store errors.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// The presented API key does not resolve to any pairing record.
    /// Surfaced at the boundary; never enters the approval queue.
    #[error("Unknown or invalid API key")]
    UnknownApiKey,

    #[error("Invalid service home page {url}: {reason}")]
    InvalidHomePage { url: String, reason: String },

    #[error("Pairing store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pairing store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wallet-connection protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A call request with no mapping to a device operation. Rejected at
    /// the protocol boundary without touching the approval queue.
    #[error("JSON RPC method not supported: {method}")]
    UnsupportedMethod { method: String },

    #[error("Session not found: {topic}")]
    SessionNotFound { topic: String },

    #[error("Session {topic} is {state}, expected {expected}")]
    InvalidSessionState {
        topic: String,
        state: String,
        expected: String,
    },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Bridge server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bridge server failed to start: {reason}")]
    StartupFailed { reason: String },
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
