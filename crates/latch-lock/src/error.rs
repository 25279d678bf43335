//! Lease and locker error types

use latch_store::StoreError;

/// Failure of a lease acquisition
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// A live record for the key is held by another lease
    #[error("lock '{key}' is already held{}", holder_suffix(.holder))]
    AlreadyLocked { key: String, holder: Option<String> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|h| format!(" by {}", h))
        .unwrap_or_default()
}

impl LeaseError {
    pub fn is_contention(&self) -> bool {
        matches!(self, LeaseError::AlreadyLocked { .. })
    }
}

/// Errors surfaced to the host upload server
///
/// Contention and ownership problems are reported as the two domain kinds;
/// store failures on release pass through unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockerError {
    #[error("file currently locked")]
    FileLocked,

    #[error("lock not held")]
    LockNotHeld,

    #[error(transparent)]
    Store(#[from] StoreError),
}
