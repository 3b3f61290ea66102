/// Error types shared by the analysis crates.
///
/// These represent failures in infrastructure components (key-value store, JSON codec)
/// rather than in the analysis pipeline itself. Application errors wrap `CommonError`
/// via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis unavailable: no usable REDIS_URL")]
    RedisUnavailable,

    #[error("stored value is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}
