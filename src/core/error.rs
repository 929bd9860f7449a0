use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Invalid blob handle: {0}")]
    InvalidHandle(String),

    #[error("Invalid inline media literal: {0}")]
    InvalidInlineMedia(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema migration error: {0}")]
    Migration(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Commit timed out after {0} ms")]
    CommitTimeout(u64),

    #[error("Mirror permission denied for {0}")]
    MirrorPermissionDenied(String),

    #[error("Mirror not connected")]
    MirrorNotConnected,

    #[error("Import error: {0}")]
    Import(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for VaultError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::ExecutionError(format!("lock poisoned: {}", err))
    }
}
