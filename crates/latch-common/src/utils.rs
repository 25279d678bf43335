//! Utility functions for Latch

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix milliseconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a fresh fencing token
///
/// Every successful acquisition writes a new token, so a holder that lost its
/// lease can never match the precondition of the next owner's record.
pub fn new_fence_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Owner name recorded in lock records: `<hostname>-<random suffix>`
///
/// The suffix keeps two lockers in the same process distinguishable.
pub fn default_owner_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "latch-node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
