use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid camera parameters: {0}")]
    Validation(String),

    #[error("Camera '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("Camera '{id}' not found")]
    NotFound { id: String },

    #[error("Camera '{id}' stream failed to open: {reason}")]
    StreamOpenFailed { id: String, reason: String },

    #[error("Camera '{id}' opened but delivered no initial frame")]
    NoInitialFrame { id: String },

    #[error("Camera '{id}' read failed {failures} consecutive times")]
    PersistentReadFailure { id: String, failures: u32 },

    #[error("Encoder spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
