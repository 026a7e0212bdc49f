//! Error types for user-sync-reconciler

use thiserror::Error;

/// Result type alias using our error
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Required columns are missing or the group block sentinels are out of order
    #[error("Schema error: {0}")]
    Schema(String),

    /// A group write would have landed at or past the block end sentinel
    #[error("Allocation invariant violated: {0}")]
    AllocationInvariant(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or written
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn schema(msg: impl Into<String>) -> Self {
        SyncError::Schema(msg.into())
    }

    pub fn allocation_invariant(msg: impl Into<String>) -> Self {
        SyncError::AllocationInvariant(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
