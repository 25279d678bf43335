//! Lock record data model

use std::fmt;

use serde::{Deserialize, Serialize};

use latch_common::current_timestamp;

/// Durable representation of a held lock
///
/// At most one record exists per key. `fence_token` is replaced on every
/// successful acquisition; renewals only move `expires_at` forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock identifier (an upload id)
    pub key: String,
    /// Owner-generation marker used as the write precondition
    pub fence_token: String,
    /// Name of the locker that wrote the record
    pub owner: String,
    /// Lease window in milliseconds
    pub lease_duration_ms: u64,
    /// Acquisition timestamp (Unix millis, holder's clock)
    pub acquired_at: i64,
    /// Lease expiry timestamp (Unix millis, holder's clock)
    pub expires_at: i64,
    /// Last successful renewal (Unix millis)
    #[serde(default)]
    pub last_renewed_at: Option<i64>,
    /// Number of successful renewals under this token
    #[serde(default)]
    pub renewal_count: u32,
    /// Opaque data stored alongside the lock
    #[serde(default)]
    pub payload: Option<String>,
}

impl LockRecord {
    /// Create a record for a fresh acquisition starting now
    pub fn new(
        key: impl Into<String>,
        fence_token: impl Into<String>,
        owner: impl Into<String>,
        lease_duration_ms: u64,
    ) -> Self {
        let now = current_timestamp();
        Self {
            key: key.into(),
            fence_token: fence_token.into(),
            owner: owner.into(),
            lease_duration_ms,
            acquired_at: now,
            expires_at: now + lease_duration_ms as i64,
            last_renewed_at: None,
            renewal_count: 0,
            payload: None,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }

    /// Whether the lease has run out at `now`, allowing `skew_ms` of clock drift
    ///
    /// The expiry was written with the holder's clock, so a reader only treats
    /// the record as abandoned once its own clock is past expiry plus the
    /// tolerance.
    pub fn is_expired_at(&self, now: i64, skew_ms: u64) -> bool {
        now > self.expires_at.saturating_add(skew_ms as i64)
    }

    /// Whether the lease has run out now
    pub fn is_expired(&self, skew_ms: u64) -> bool {
        self.is_expired_at(current_timestamp(), skew_ms)
    }

    /// Remaining lease in milliseconds (0 once expired)
    pub fn remaining_ttl_ms(&self) -> u64 {
        let now = current_timestamp();
        if self.expires_at > now {
            (self.expires_at - now) as u64
        } else {
            0
        }
    }

    /// Build the record written by a renewal at `now`
    pub fn renewed_at(&self, now: i64) -> Self {
        Self {
            expires_at: now + self.lease_duration_ms as i64,
            last_renewed_at: Some(now),
            renewal_count: self.renewal_count.saturating_add(1),
            ..self.clone()
        }
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expires = chrono::DateTime::from_timestamp_millis(self.expires_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.expires_at.to_string());
        write!(
            f,
            "{} (owner: {}, expires: {}, renewals: {})",
            self.key, self.owner, expires, self.renewal_count
        )
    }
}
