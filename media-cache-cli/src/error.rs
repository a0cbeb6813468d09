use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] media_cache::CacheError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
