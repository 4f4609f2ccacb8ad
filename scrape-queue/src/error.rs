use thiserror::Error;

/// Result type for queue and system operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for the scraping job system
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Profile store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the external profile store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Profile store unavailable: {0}")]
    Unavailable(String),

    #[error("Profile store query failed: {0}")]
    Query(String),
}

/// Outcome of a failed scrape - every variant is retried through the queue
#[derive(Error, Debug, Clone)]
pub enum ScrapeError {
    /// Network or parsing failure reported by the scraper
    #[error("Scrape failed: {0}")]
    Failed(String),

    /// The target site blocked or rate limited the request
    #[error("Scrape blocked: {0}")]
    Blocked(String),

    /// The scrape did not finish in time
    #[error("Scrape timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ScrapeError {
    /// Create a generic scrape failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Failed(msg) | Self::Blocked(msg) => msg.clone(),
            Self::Timeout(after) => format!("timed out after {:?}", after),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}
