//! Error types for DICOM Upper Layer and DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur while negotiating or using an association
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed or unexpected PDU content
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered the A-ASSOCIATE-RQ with an A-ASSOCIATE-RJ
    #[error("Association rejected: result={result} source={source_id} reason={reason}")]
    AssociationRejected { result: u8, source_id: u8, reason: u8 },

    /// An A-ABORT was received or raised locally; the association is gone
    #[error("Association aborted: source={source_id} reason={reason}")]
    Aborted { source_id: u8, reason: u8 },

    /// Transport failure while establishing an association
    #[error("A-P-ABORT from {peer}: {reason}")]
    ProviderAbort { peer: String, reason: String },

    #[error("Invalid association state: {0}")]
    InvalidState(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("Transcoding error: {0}")]
    Transcode(String),

    #[error("Move destination unknown: {0}")]
    MoveDestinationUnknown(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the association this error came from can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::Protocol(_)
                | DimseError::AssociationRejected { .. }
                | DimseError::Aborted { .. }
                | DimseError::ProviderAbort { .. }
        )
    }
}
