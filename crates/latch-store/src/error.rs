//! Store error types

/// Failure of a store operation itself
///
/// A failed precondition is not an error; it is reported as
/// [`PutOutcome::ConditionFailed`](crate::PutOutcome::ConditionFailed) or
/// [`WriteOutcome::ConditionFailed`](crate::WriteOutcome::ConditionFailed).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed lock record '{key}': {message}")]
    Malformed { key: String, message: String },

    #[error("provisioning error: {0}")]
    Provisioning(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
