use std::path::PathBuf;

use thiserror::Error;

/// lxdocker error types
#[derive(Error, Debug)]
pub enum LxdockerError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Image spec could not be read or decoded
    #[error("Spec `{name}`: {message}")]
    SpecError { name: String, message: String },

    /// Registry interaction failed (reference parse, fetch, index update)
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Filesystem operation failed
    #[error("Filesystem error at {path}: {source}")]
    FilesystemError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Tar or gzip stream failure
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Malformed content digest
    #[error("Invalid digest: {0}")]
    DigestError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for LxdockerError {
    fn from(err: serde_json::Error) -> Self {
        LxdockerError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for LxdockerError {
    fn from(err: serde_yaml::Error) -> Self {
        LxdockerError::SerializationError(err.to_string())
    }
}

impl LxdockerError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LxdockerError::FilesystemError {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for lxdocker operations
pub type Result<T> = std::result::Result<T, LxdockerError>;
