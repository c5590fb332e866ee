//! Error types and error support code.

/// Error type used by the context-bound pool.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Pool configuration failed validation at initialization time.
    #[error("invalid pool configuration: {0}")]
    ConfigInvalid(String),
    /// No resource could be obtained within the acquisition timeout and retries.
    #[error("pool is exhausted")]
    PoolExhausted,
    /// Context-bound acquisition was requested outside of a logical context.
    #[error("not running inside a logical context")]
    NoContext,
    /// Lease was used after its binding had been released.
    #[error("lease was already released")]
    LeaseReleased,
    /// Error while loading pool configuration from external sources.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the failed operation may succeed if retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}
