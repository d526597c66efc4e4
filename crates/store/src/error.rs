use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("watch closed unexpectedly")]
    WatchClosed,

    #[error("watch error: {0}")]
    Watch(String),

    #[error("value encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
