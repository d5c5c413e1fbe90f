use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetwireError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, FleetwireError>;
