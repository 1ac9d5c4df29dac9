//! Cache error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Durable tier timed out: {0}")]
    Timeout(#[from] resilience::TimeoutError),

    #[error("Entry of {size} bytes exceeds the {limit} byte budget")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid cache data: {0}")]
    InvalidData(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
