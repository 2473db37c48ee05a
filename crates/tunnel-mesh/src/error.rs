//! Error types for the mesh data-plane.

use thiserror::Error;

/// Mesh-specific errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A CIDR string could not be parsed.
    #[error("Invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// The reserved static range is not part of the overlay network.
    #[error(
        "network configuration has staticRange {static_range} defined but the range does not exist in the configured network {network}"
    )]
    StaticRangeOutsideNetwork {
        network: String,
        static_range: String,
    },

    /// UDP socket queue provisioning or I/O error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// TUN device queue provisioning or I/O error.
    #[error("Device error: {0}")]
    Device(String),

    /// AEAD key or seal/open failure.
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Control channel transport or framing error.
    #[error("Control channel error: {0}")]
    Control(String),

    /// The remote end of the control channel answered with an error.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// No mapping is registered for the requested address.
    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    /// Worker process could not be spawned.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// One or more queues failed to close.
    #[error("error closing the {kind} queues: {}", .failures.join("; "))]
    Close {
        kind: &'static str,
        failures: Vec<String>,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// Returns true if the error is a per-packet condition rather than a
    /// provisioning or configuration failure.
    ///
    /// Packet-level errors are dropped and counted by the pipelines; everything
    /// else is fatal at start-up.
    pub fn is_packet_level(&self) -> bool {
        matches!(
            self,
            MeshError::Cipher(_) | MeshError::MappingNotFound(_) | MeshError::Rpc { .. }
        )
    }
}

/// Result type alias for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
