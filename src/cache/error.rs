use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis connection error: {0}")]
    ConnectionError(String),

    #[error("redis command failed: {0}")]
    CommandError(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::CommandError(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
