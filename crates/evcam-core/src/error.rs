use thiserror::Error;

pub type EvcamResult<T> = Result<T, EvcamError>;

#[derive(Debug, Error)]
pub enum EvcamError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
