//! Error types for key source loading

/// Errors from loading the key source file. All of these are fatal at
/// startup: the pool is unusable without at least one valid key.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("key file parse error: {0}")]
    Parse(String),

    #[error("invalid key file: {0}")]
    Invalid(String),
}

/// Result alias for key source operations.
pub type Result<T> = std::result::Result<T, Error>;
