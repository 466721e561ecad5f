//! Error types for swarmlink

use thiserror::Error;

/// Main error type for swarm client operations
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Unclassified failure, including exhausted retries
    #[error("Generic error: {0}")]
    Generic(String),

    /// The network rejected our timestamp; the clock offset needs recalibrating
    #[error("Clock out of sync with the storage network")]
    ClockOutOfSync,

    /// No local identity key pair is available
    #[error("No key pair available")]
    NoKeyPair,

    /// Producing a signature failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Hashing an input (e.g. an ONS name) failed
    #[error("Hashing failed: {0}")]
    HashingFailed(String),

    /// A response or signature did not validate
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The message is missing required fields or is otherwise unusable
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Converting a message to or from its wire form failed
    #[error("Proto conversion failed: {0}")]
    ProtoConversionFailed(String),

    /// Encrypting a payload failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// A storage node misbehaved. Recovered inside the RPC layer and never
    /// surfaced to callers above it.
    #[error("Node fault (status {status}): {message}")]
    NodeFault { status: u16, message: String },

    /// The onion transport could not deliver the request
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// The operation was cancelled (poller stopped)
    #[error("Operation cancelled")]
    Cancelled,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Whether retrying the same logical operation on another node may help.
    ///
    /// Cryptographic and validation failures are permanent for a given input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::NodeFault { .. } | SwarmError::Transport(_) | SwarmError::Generic(_)
        )
    }

    /// Whether this error must stay inside the RPC layer.
    pub fn is_node_fault(&self) -> bool {
        matches!(self, SwarmError::NodeFault { .. } | SwarmError::Transport(_))
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(e: serde_json::Error) -> Self {
        SwarmError::Serialization(e.to_string())
    }
}

impl From<postcard::Error> for SwarmError {
    fn from(e: postcard::Error) -> Self {
        SwarmError::Serialization(e.to_string())
    }
}

/// Result type alias using SwarmError
pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SwarmError::NodeFault {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(format!("{}", err), "Node fault (status 502): bad gateway");
        assert_eq!(
            SwarmError::ClockOutOfSync.to_string(),
            "Clock out of sync with the storage network"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SwarmError = io_err.into();
        assert!(matches!(err, SwarmError::Io(_)));
    }

    #[test]
    fn test_crypto_errors_are_not_retryable() {
        assert!(!SwarmError::DecryptionFailed("x".into()).is_retryable());
        assert!(!SwarmError::SigningFailed("x".into()).is_retryable());
        assert!(!SwarmError::ClockOutOfSync.is_retryable());
        assert!(SwarmError::Transport("timeout".into()).is_retryable());
    }
}
