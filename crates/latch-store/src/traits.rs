//! Lock Record Store port
//!
//! Defines the single-key conditional-write contract the lease protocol is
//! built on.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::LockRecord;

/// Condition a write must satisfy against the currently stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition<'a> {
    /// No record exists for the key
    Absent,
    /// A record exists and carries this fencing token
    TokenMatches(&'a str),
}

/// Result of a conditional write or delete that reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The precondition held and the operation was applied
    Applied,
    /// The precondition did not hold; nothing changed
    ConditionFailed,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        self == WriteOutcome::Applied
    }
}

/// Result of a conditional put that reached the store
///
/// A rejected put carries the record that blocked it when the store returns
/// it with the failure, so callers can inspect the holder without a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    ConditionFailed { current: Option<LockRecord> },
}

impl PutOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PutOutcome::Applied)
    }
}

/// Capacity of a newly provisioned lock table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityMode {
    /// Pay-per-request billing
    #[default]
    OnDemand,
    /// Fixed read/write capacity units
    Provisioned { read_units: i64, write_units: i64 },
}

impl std::fmt::Display for CapacityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityMode::OnDemand => write!(f, "on-demand"),
            CapacityMode::Provisioned {
                read_units,
                write_units,
            } => write!(f, "provisioned (read={}, write={})", read_units, write_units),
        }
    }
}

/// Conditional-write key-value store holding lock records
///
/// Every method is atomic with respect to a single key. Implementations must
/// report precondition failures as outcomes and keep errors for failures of
/// the operation itself.
#[async_trait]
pub trait LockRecordStore: Send + Sync {
    /// Read the record for `key`
    async fn get(&self, key: &str) -> Result<Option<LockRecord>>;

    /// Insert or replace `record` if `precondition` holds
    ///
    /// On a failed precondition the stored record, if any, is returned.
    async fn put_if(
        &self,
        record: &LockRecord,
        precondition: Precondition<'_>,
    ) -> Result<PutOutcome>;

    /// Delete the record for `key` if it still carries `fence_token`
    async fn delete_if(&self, key: &str, fence_token: &str) -> Result<WriteOutcome>;

    /// Provision the backing table; not used on the lock hot path
    async fn create_table(&self, capacity: CapacityMode) -> Result<()>;
}
