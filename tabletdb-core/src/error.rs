//! Error types for TabletDB

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for TabletDB operations
pub type Result<T> = std::result::Result<T, TabletError>;

/// TabletDB error types
#[derive(Error, Debug)]
pub enum TabletError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization of a persisted structure failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Client schema or projection is incompatible with the tablet schema
    #[error("Mismatched schema: {0}")]
    MismatchedSchema(String),

    /// Client supplied server-only schema metadata, or an invalid alteration
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Malformed encoded mutation
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    /// Row with the same primary key already exists
    #[error("Already present: {0}")]
    AlreadyPresent(String),

    /// Row or other entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tablet not found
    #[error("Tablet not found: {0}")]
    TabletNotFound(String),

    /// Tablet already exists
    #[error("Tablet already exists: {0}")]
    TabletAlreadyExists(String),

    /// Scanner expired or never existed
    #[error("Scanner expired: {0}")]
    ScannerExpired(String),

    /// Rejected configuration change
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed request structure
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Application-level error codes reported in tablet server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletServerErrorCode {
    UnknownError,
    InvalidSchema,
    MismatchedSchema,
    InvalidMutation,
    TabletNotFound,
    TabletAlreadyExists,
    ScannerExpired,
    InvalidConfig,
}

impl TabletError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TabletError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TabletError::Corruption(_) | TabletError::ChecksumMismatch { .. }
        )
    }

    /// Response code for this error
    pub fn code(&self) -> TabletServerErrorCode {
        match self {
            TabletError::MismatchedSchema(_) => TabletServerErrorCode::MismatchedSchema,
            TabletError::InvalidSchema(_) => TabletServerErrorCode::InvalidSchema,
            TabletError::InvalidMutation(_) => TabletServerErrorCode::InvalidMutation,
            TabletError::TabletNotFound(_) => TabletServerErrorCode::TabletNotFound,
            TabletError::TabletAlreadyExists(_) => TabletServerErrorCode::TabletAlreadyExists,
            TabletError::ScannerExpired(_) => TabletServerErrorCode::ScannerExpired,
            TabletError::InvalidConfig(_) => TabletServerErrorCode::InvalidConfig,
            _ => TabletServerErrorCode::UnknownError,
        }
    }
}

impl From<bincode::Error> for TabletError {
    fn from(e: bincode::Error) -> Self {
        TabletError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TabletError {
    fn from(e: serde_json::Error) -> Self {
        TabletError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = TabletError::MismatchedSchema("missing column".into());
        assert_eq!(err.code(), TabletServerErrorCode::MismatchedSchema);
        assert_eq!(err.to_string(), "Mismatched schema: missing column");

        let err = TabletError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(err.is_retryable());
        assert_eq!(err.code(), TabletServerErrorCode::UnknownError);

        assert!(TabletError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
    }
}
