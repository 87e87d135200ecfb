//! Error types for BLE mesh operations

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during BLE mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Chunk of {chunk_len} bytes does not fit the transport's {ceiling} byte packets")]
    PacketTooLarge { chunk_len: usize, ceiling: usize },

    #[error("BLE adapter error: {0}")]
    AdapterError(String),

    #[error("Packet transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Every message id is in use")]
    IdsExhausted,

    #[error("Mesh engine is not running")]
    EngineStopped,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::AdapterError(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError(err.to_string())
    }
}
