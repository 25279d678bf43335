//! Lease lock client
//!
//! Acquires, renews and releases leases on lock records through a
//! [`LockRecordStore`]. Acquisition is fail-fast: it never waits for a held
//! lock, and a live holder is reported after a single store round trip.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use latch_common::{
    DEFAULT_CLOCK_SKEW_TOLERANCE_MS, current_timestamp, default_owner_name, new_fence_token,
};
use latch_store::{LockRecord, LockRecordStore, Precondition, PutOutcome, StoreError};

use crate::error::LeaseError;
use crate::lease::{ActiveLeases, LeaseHandle, LeaseOptions, LeaseState};
use crate::metrics::{self, Timer};

/// Client for lease-based locks
pub struct LeaseLockClient {
    store: Arc<dyn LockRecordStore>,
    owner: String,
    clock_skew_tolerance: Duration,
    // Handles hold a weak reference so dropping one untracks its lease
    active: Arc<ActiveLeases>,
}

impl LeaseLockClient {
    pub fn new(store: Arc<dyn LockRecordStore>) -> Self {
        Self {
            store,
            owner: default_owner_name(),
            clock_skew_tolerance: Duration::from_millis(DEFAULT_CLOCK_SKEW_TOLERANCE_MS),
            active: Arc::new(ActiveLeases::new()),
        }
    }

    /// Name written into every record this client acquires
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Extra margin past a record's expiry before it may be reclaimed
    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn LockRecordStore> {
        &self.store
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        self.clock_skew_tolerance
    }

    /// Number of leases acquired and not yet released
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Try to acquire the lock for `key`
    ///
    /// Returns [`LeaseError::AlreadyLocked`] while another holder's lease is
    /// live. A record whose expiry has passed (plus the clock skew tolerance)
    /// is reclaimed under a new fencing token with one more conditional put.
    pub async fn acquire(
        &self,
        key: &str,
        options: &LeaseOptions,
    ) -> Result<LeaseHandle, LeaseError> {
        let timer = Timer::new();

        let record = self.new_record(key, options);
        let outcome = self.store.put_if(&record, Precondition::Absent).await?;
        let existing = match outcome {
            PutOutcome::Applied => return Ok(self.activate(record, options, "acquired", &timer)),
            PutOutcome::ConditionFailed {
                current: Some(existing),
            } => existing,
            // Store did not return the blocking record
            PutOutcome::ConditionFailed { current: None } => match self.store.get(key).await? {
                Some(existing) => existing,
                None => {
                    // Released between our put and read; one more try
                    debug!(key = %key, "Lock record vanished, retrying acquisition");
                    if self.store.put_if(&record, Precondition::Absent).await?.is_applied() {
                        return Ok(self.activate(record, options, "acquired", &timer));
                    }
                    return Err(self.contended(key, None, &timer));
                }
            },
        };

        let skew_ms = self.clock_skew_tolerance.as_millis() as u64;
        if !existing.is_expired_at(current_timestamp(), skew_ms) {
            return Err(self.contended(key, Some(existing.owner), &timer));
        }

        let record = self.new_record(key, options);
        let outcome = self
            .store
            .put_if(&record, Precondition::TokenMatches(&existing.fence_token))
            .await?;
        match outcome {
            PutOutcome::Applied => {
                info!(
                    key = %key,
                    previous_owner = %existing.owner,
                    expired_at = existing.expires_at,
                    "Reclaimed expired lock"
                );
                Ok(self.activate(record, options, "reclaimed", &timer))
            }
            // Another contender reclaimed it first
            PutOutcome::ConditionFailed { .. } => {
                Err(self.contended(key, Some(existing.owner), &timer))
            }
        }
    }

    fn new_record(&self, key: &str, options: &LeaseOptions) -> LockRecord {
        let lease_ms = options.lease_duration().as_millis() as u64;
        LockRecord::new(key, new_fence_token(), self.owner.as_str(), lease_ms)
            .with_payload(options.payload().map(str::to_string))
    }

    fn activate(
        &self,
        record: LockRecord,
        options: &LeaseOptions,
        outcome: &str,
        timer: &Timer,
    ) -> LeaseHandle {
        let state = Arc::new(LeaseState::new(&record));
        self.active.insert(record.fence_token.clone(), state.clone());

        debug!(
            key = %record.key,
            owner = %record.owner,
            expires_at = record.expires_at,
            "Lock acquired"
        );
        state.start_renewal(self.store.clone(), options.renewal_period());

        metrics::record_acquire(outcome, timer.elapsed_secs());
        metrics::lock_held();
        LeaseHandle::new(state, options, Arc::downgrade(&self.active))
    }

    fn contended(&self, key: &str, holder: Option<String>, timer: &Timer) -> LeaseError {
        metrics::record_acquire("contended", timer.elapsed_secs());
        debug!(key = %key, holder = ?holder, "Lock is held by another owner");
        LeaseError::AlreadyLocked {
            key: key.to_string(),
            holder,
        }
    }

    fn untrack(&self, state: &LeaseState) {
        if self.active.remove(&state.fence_token).is_some() {
            metrics::lock_dropped();
        }
    }

    /// Release a lease
    ///
    /// Stops renewal first, then deletes the record if it still carries this
    /// lease's fencing token. Returns `Ok(false)` when the lease had already
    /// been lost or the record now belongs to someone else.
    ///
    /// A store error leaves the lease held and renewing, so the same handle
    /// can be released again once the store is reachable.
    pub async fn release(&self, handle: &LeaseHandle) -> Result<bool, StoreError> {
        let state = &handle.state;
        state.stop_renewal().await;
        if !state.is_valid() {
            self.untrack(state);
            debug!(key = %state.key, "Released lease was already lost");
            metrics::record_release(false);
            return Ok(false);
        }

        let outcome = match self.store.delete_if(&state.key, &state.fence_token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %state.key, "Failed to delete lock record, lease kept: {}", e);
                state.start_renewal(self.store.clone(), handle.renewal_period());
                return Err(e);
            }
        };

        state.invalidate();
        self.untrack(state);
        let released = outcome.is_applied();
        metrics::record_release(released);
        if released {
            debug!(key = %state.key, "Lock released");
        } else {
            warn!(key = %state.key, "Lock record was taken over before release");
        }
        Ok(released)
    }

    /// Stop every active lease and delete their records
    ///
    /// Deletion is best effort; failures are logged and leave the record to
    /// expire. Returns the number of leases that were closed.
    pub async fn close_all(&self) -> usize {
        let tokens: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        let states: Vec<Arc<LeaseState>> = tokens
            .iter()
            .filter_map(|token| self.active.remove(token).map(|(_, state)| state))
            .collect();
        let count = states.len();

        let releases = states.into_iter().map(|state| {
            let store = self.store.clone();
            async move {
                metrics::lock_dropped();
                state.stop_renewal().await;
                if !state.invalidate() {
                    return;
                }
                match store.delete_if(&state.key, &state.fence_token).await {
                    Ok(outcome) => metrics::record_release(outcome.is_applied()),
                    Err(e) => warn!(key = %state.key, "Failed to delete lock on close: {}", e),
                }
            }
        });
        join_all(releases).await;

        if count > 0 {
            info!(count = count, "Closed all active leases");
        }
        count
    }
}
