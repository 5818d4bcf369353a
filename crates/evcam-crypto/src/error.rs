use std::path::PathBuf;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key unavailable at {path}: {reason}")]
    KeyUnavailable { path: PathBuf, reason: String },

    #[error("encryption failed")]
    Encrypt,

    #[error("header encoding failed: {0}")]
    Header(#[from] serde_json::Error),

    #[error("video backend: {0}")]
    Video(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
