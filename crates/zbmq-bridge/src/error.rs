//! Error types for bridge operations
//!
//! Every failure the bridge can observe is a [`BridgeError`]. The variants
//! fall into two groups: fatal errors that stop the process (configuration,
//! storage corruption, mesh startup) and per-event errors that are logged,
//! optionally published to the log topic, and then forgotten.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Configuration Errors =====
    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // ===== Storage Errors =====
    /// Device directory file could not be parsed
    #[error("Device directory {path} is corrupt: {reason}")]
    StorageCorrupt {
        /// Store location
        path: String,
        /// Parse failure reason
        reason: String,
    },

    /// Device directory could not be written
    #[error("Device directory write failed: {0}")]
    StorageWrite(String),

    // ===== Message Errors =====
    /// Inbound payload did not match any known shape
    #[error("Malformed payload: {0}")]
    PayloadMalformed(String),

    /// Address segment is neither a short address nor an extended id
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    // ===== Transport Errors =====
    /// Mesh send or control request failed
    #[error("Mesh transport error: {0}")]
    MeshTransport(String),

    /// Pub/sub client failure
    #[error("Pub/sub transport error: {0}")]
    PubSubTransport(String),

    /// Publish attempted while the broker connection is down
    #[error("Pub/sub transport not connected")]
    NotConnected,

    /// Request to a collaborator timed out
    #[error("Request timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Lifecycle Errors =====
    /// Mesh stack failed to start; no bridge can run without it
    #[error("Mesh startup failed: {0}")]
    MeshStartupFailed(String),

    /// Bridge not running
    #[error("Bridge is not running")]
    BridgeNotRunning,

    /// Bridge already running
    #[error("Bridge is already running")]
    BridgeAlreadyRunning,

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigInvalid(_)
                | BridgeError::StorageCorrupt { .. }
                | BridgeError::MeshStartupFailed(_)
        )
    }

    /// Check if this error came from one of the two transports
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            BridgeError::MeshTransport(_)
                | BridgeError::PubSubTransport(_)
                | BridgeError::NotConnected
                | BridgeError::Timeout { .. }
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "CONFIG_INVALID",
            BridgeError::StorageCorrupt { .. } => "STORAGE_CORRUPT",
            BridgeError::StorageWrite(_) => "STORAGE_WRITE",
            BridgeError::PayloadMalformed(_) => "PAYLOAD_MALFORMED",
            BridgeError::InvalidAddress(_) => "INVALID_ADDRESS",
            BridgeError::MeshTransport(_) => "MESH_TRANSPORT",
            BridgeError::PubSubTransport(_) => "PUBSUB_TRANSPORT",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::Timeout { .. } => "TIMEOUT",
            BridgeError::MeshStartupFailed(_) => "MESH_STARTUP_FAILED",
            BridgeError::BridgeNotRunning => "BRIDGE_NOT_RUNNING",
            BridgeError::BridgeAlreadyRunning => "BRIDGE_ALREADY_RUNNING",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::PubSubTransport(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelClosed
    }
}
