//! Error types shared by Latch crates

/// Application-level errors that are not tied to a store or a lease
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LatchError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, LatchError>;
