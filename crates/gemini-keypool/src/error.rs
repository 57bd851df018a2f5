//! Error types for pool operations

/// Errors from pool operations.
///
/// `Exhausted` is an expected, recoverable outcome: every key is currently
/// rate-limited, cooling down, or retired, and the caller decides whether to
/// back off, retry, or surface a transient failure. `Empty` means the pool
/// was constructed without any keys, which is a configuration fault rather
/// than a runtime state - the two must stay distinguishable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool exhausted: {0}")]
    Exhausted(String),

    #[error("key pool constructed with no keys")]
    Empty,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
