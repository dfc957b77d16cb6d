//! Error types shared by the HCCR crates.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for character recognition training and inference.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred (manifest or checkpoint write, unreadable directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An image could not be opened or decoded
    #[error("Failed to decode image '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A manifest line could not be parsed
    #[error("Malformed manifest line {line}: {reason}")]
    Manifest { line: usize, reason: String },

    /// A checkpoint file exists but its content is unusable
    #[error("Corrupt checkpoint '{path}': {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// Out of memory or a comparable device failure during a step
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Builds a decode error for the image at `path`.
    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds a corrupt-checkpoint error for the file at `path`.
    pub fn corrupt_checkpoint(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptCheckpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for HCCR operations.
pub type Result<T> = std::result::Result<T, Error>;
