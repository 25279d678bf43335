// In-memory lock record store
// Shares records between lockers in one process; used by tests and single-host setups

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::record::LockRecord;
use crate::traits::{CapacityMode, LockRecordStore, Precondition, PutOutcome, WriteOutcome};

/// Lock record store backed by a `DashMap`
///
/// Cloning yields another handle to the same records, so several lockers can
/// coordinate through one instance the way separate processes coordinate
/// through a shared table.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<DashMap<String, LockRecord>>,
    unavailable: Arc<AtomicBool>,
    operations: Arc<AtomicU64>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with a
    /// transport error
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of operations that reached the store
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current record for `key`, bypassing availability and operation counting
    pub fn snapshot(&self, key: &str) -> Option<LockRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Write a record unconditionally, e.g. one left behind by a crashed holder
    pub fn insert_raw(&self, record: LockRecord) {
        self.records.insert(record.key.clone(), record);
    }

    fn check_available(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockRecordStore for MemoryLockStore {
    async fn get(&self, key: &str) -> Result<Option<LockRecord>> {
        self.check_available()?;
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn put_if(
        &self,
        record: &LockRecord,
        precondition: Precondition<'_>,
    ) -> Result<PutOutcome> {
        self.check_available()?;

        let outcome = match self.records.entry(record.key.clone()) {
            Entry::Vacant(vacant) => match precondition {
                Precondition::Absent => {
                    vacant.insert(record.clone());
                    PutOutcome::Applied
                }
                Precondition::TokenMatches(_) => PutOutcome::ConditionFailed { current: None },
            },
            Entry::Occupied(mut occupied) => match precondition {
                Precondition::TokenMatches(token) if occupied.get().fence_token == token => {
                    occupied.insert(record.clone());
                    PutOutcome::Applied
                }
                _ => PutOutcome::ConditionFailed {
                    current: Some(occupied.get().clone()),
                },
            },
        };

        let applied = outcome.is_applied();
        debug!(key = %record.key, ?precondition, applied, "Conditional put");
        Ok(outcome)
    }

    async fn delete_if(&self, key: &str, fence_token: &str) -> Result<WriteOutcome> {
        self.check_available()?;

        let removed = self
            .records
            .remove_if(key, |_, record| record.fence_token == fence_token);

        Ok(if removed.is_some() {
            WriteOutcome::Applied
        } else {
            WriteOutcome::ConditionFailed
        })
    }

    async fn create_table(&self, capacity: CapacityMode) -> Result<()> {
        self.check_available()?;
        debug!(%capacity, "In-memory store needs no table provisioning");
        Ok(())
    }
}
