//! Lease handles and their renewal loops
//!
//! Every acquired lease owns exactly one background task that re-puts the lock
//! record with a fresh expiry, conditioned on the lease's fencing token. The
//! task is started by the client on acquisition and stopped on release, on
//! teardown, or by itself once the lease is lost.

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use latch_common::{
    DEFAULT_LEASE_DURATION_MS, HEARTBEAT_DIVISOR, LatchError, current_timestamp,
};
use latch_store::{LockRecord, LockRecordStore, Precondition, PutOutcome};

use crate::metrics::{
    self as lock_metrics, LEASES_LOST_TOTAL, RENEWAL_FAILURES_TOTAL, RENEWALS_TOTAL,
};

/// Lease policy for one acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOptions {
    lease_duration: Duration,
    renewal_period: Duration,
    payload: Option<String>,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        let lease_duration = Duration::from_millis(DEFAULT_LEASE_DURATION_MS);
        Self {
            lease_duration,
            renewal_period: lease_duration / HEARTBEAT_DIVISOR,
            payload: None,
        }
    }
}

impl LeaseOptions {
    /// Lease of `lease_duration`, renewed `HEARTBEAT_DIVISOR` times per window
    pub fn new(lease_duration: Duration) -> Result<Self, LatchError> {
        Self::with_heartbeat_divisor(lease_duration, HEARTBEAT_DIVISOR)
    }

    /// Lease of `lease_duration`, renewed `divisor` times per window
    ///
    /// The renewal period is truncated to whole milliseconds.
    pub fn with_heartbeat_divisor(
        lease_duration: Duration,
        divisor: u32,
    ) -> Result<Self, LatchError> {
        if divisor < 2 {
            return Err(LatchError::IllegalArgument(format!(
                "heartbeat divisor must be at least 2, got {}",
                divisor
            )));
        }
        let period_ms = lease_duration.as_millis() as u64 / u64::from(divisor);
        let options = Self {
            lease_duration,
            renewal_period: Duration::from_millis(period_ms),
            payload: None,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn from_millis(lease_duration_ms: u64) -> Result<Self, LatchError> {
        Self::new(Duration::from_millis(lease_duration_ms))
    }

    /// Override the renewal period; it must be shorter than the lease
    pub fn with_renewal_period(mut self, renewal_period: Duration) -> Result<Self, LatchError> {
        self.renewal_period = renewal_period;
        self.validate()?;
        Ok(self)
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renewal_period(&self) -> Duration {
        self.renewal_period
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    fn validate(&self) -> Result<(), LatchError> {
        if self.lease_duration.as_millis() == 0 {
            return Err(LatchError::IllegalArgument(
                "lease duration must be at least 1ms".to_string(),
            ));
        }
        if self.renewal_period.as_millis() == 0 {
            return Err(LatchError::IllegalArgument(
                "renewal period must be at least 1ms".to_string(),
            ));
        }
        if self.renewal_period >= self.lease_duration {
            return Err(LatchError::IllegalArgument(format!(
                "renewal period {:?} must be shorter than lease duration {:?}",
                self.renewal_period, self.lease_duration
            )));
        }
        Ok(())
    }
}

/// Running renewal loop and the channel that stops it
struct RenewalTask {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Leases a client holds and has not yet released, keyed by fencing token
pub(crate) type ActiveLeases = DashMap<String, Arc<LeaseState>>;

/// State shared between a lease handle, its renewal task and the client's
/// table of active leases
pub(crate) struct LeaseState {
    pub(crate) key: String,
    pub(crate) fence_token: String,
    valid: AtomicBool,
    expires_at: AtomicI64,
    renewals: AtomicU32,
    // Last record confirmed by the store
    latest: Mutex<LockRecord>,
    renewal: Mutex<Option<RenewalTask>>,
}

impl LeaseState {
    pub(crate) fn new(record: &LockRecord) -> Self {
        Self {
            key: record.key.clone(),
            fence_token: record.fence_token.clone(),
            valid: AtomicBool::new(true),
            expires_at: AtomicI64::new(record.expires_at),
            renewals: AtomicU32::new(0),
            latest: Mutex::new(record.clone()),
            renewal: Mutex::new(None),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Mark the lease invalid, returning whether it was valid before
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn expires_at(&self) -> i64 {
        self.expires_at.load(Ordering::SeqCst)
    }

    /// Start the renewal loop from the last confirmed record
    ///
    /// Also used to resume renewing after a release that could not reach the
    /// store.
    pub(crate) fn start_renewal(
        self: &Arc<Self>,
        store: Arc<dyn LockRecordStore>,
        period: Duration,
    ) {
        let record = self.latest.lock().clone();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_renewal(store, self.clone(), record, period, stop_rx));
        let previous = self.renewal.lock().replace(RenewalTask { stop_tx, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Stop the renewal loop and wait for it to finish
    ///
    /// A renewal already in flight completes before this returns, so no
    /// renewal can land after the caller's next store operation.
    pub(crate) async fn stop_renewal(&self) {
        let task = self.renewal.lock().take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(()).await;
            match task.handle.await {
                Err(e) if e.is_panic() => {
                    warn!(key = %self.key, "Renewal task panicked: {}", e);
                }
                _ => {}
            }
        }
    }

    /// Abort the renewal loop without waiting; returns whether one was running
    fn abort_renewal(&self) -> bool {
        match self.renewal.lock().take() {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn run_renewal(
    store: Arc<dyn LockRecordStore>,
    state: Arc<LeaseState>,
    mut record: LockRecord,
    period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        let renewed = record.renewed_at(current_timestamp());
        let result = store
            .put_if(&renewed, Precondition::TokenMatches(&record.fence_token))
            .await;

        match result {
            Ok(PutOutcome::Applied) => {
                state.expires_at.store(renewed.expires_at, Ordering::SeqCst);
                state.renewals.fetch_add(1, Ordering::SeqCst);
                *state.latest.lock() = renewed.clone();
                counter!(RENEWALS_TOTAL).increment(1);
                debug!(
                    key = %renewed.key,
                    expires_at = renewed.expires_at,
                    renewals = renewed.renewal_count,
                    "Lease renewed"
                );
                record = renewed;
            }
            Ok(PutOutcome::ConditionFailed { .. }) => {
                state.invalidate();
                counter!(LEASES_LOST_TOTAL).increment(1);
                warn!(
                    key = %record.key,
                    "Lease lost: lock record was reclaimed or removed by another owner"
                );
                break;
            }
            Err(e) => {
                counter!(RENEWAL_FAILURES_TOTAL).increment(1);
                if current_timestamp() >= state.expires_at() {
                    state.invalidate();
                    counter!(LEASES_LOST_TOTAL).increment(1);
                    warn!(key = %record.key, "Lease lost: renewal failed past expiry: {}", e);
                    break;
                }
                warn!(key = %record.key, "Lease renewal failed, retrying next period: {}", e);
            }
        }
    }
}

/// A successfully acquired lease
///
/// Handles are not `Clone`: each one owns the single renewal loop of its
/// lease. Pass it to [`LeaseLockClient::release`](crate::LeaseLockClient::release)
/// to give the lock up. Dropping a handle without releasing it stops the
/// renewal loop, removes the lease from its client's active set and leaves
/// the record to expire.
pub struct LeaseHandle {
    pub(crate) state: Arc<LeaseState>,
    active: Weak<ActiveLeases>,
    lease_duration: Duration,
    renewal_period: Duration,
}

impl LeaseHandle {
    pub(crate) fn new(
        state: Arc<LeaseState>,
        options: &LeaseOptions,
        active: Weak<ActiveLeases>,
    ) -> Self {
        Self {
            state,
            active,
            lease_duration: options.lease_duration,
            renewal_period: options.renewal_period,
        }
    }

    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn fence_token(&self) -> &str {
        &self.state.fence_token
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renewal_period(&self) -> Duration {
        self.renewal_period
    }

    /// False once the renewal loop observed that the lease was lost
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// Last confirmed expiry (Unix millis)
    pub fn expires_at(&self) -> i64 {
        self.state.expires_at()
    }

    /// Successful renewals so far
    pub fn renewal_count(&self) -> u32 {
        self.state.renewals.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.state.key)
            .field("fence_token", &self.state.fence_token)
            .field("valid", &self.is_valid())
            .field("expires_at", &self.expires_at())
            .field("lease_duration", &self.lease_duration)
            .field("renewal_period", &self.renewal_period)
            .finish()
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if self.state.abort_renewal() {
            warn!(
                key = %self.state.key,
                "Lease handle dropped without release; renewal stopped"
            );
        }
        let tracked = self
            .active
            .upgrade()
            .is_some_and(|active| active.remove(&self.state.fence_token).is_some());
        if tracked {
            lock_metrics::lock_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use latch_store::MemoryLockStore;

    #[test]
    fn test_default_options() {
        let options = LeaseOptions::default();
        assert_eq!(options.lease_duration(), Duration::from_secs(60));
        assert_eq!(options.renewal_period(), Duration::from_secs(20));
        assert!(options.payload().is_none());
    }

    #[test]
    fn test_renewal_period_is_a_third_of_lease() {
        let options = LeaseOptions::from_millis(1000).unwrap();
        assert_eq!(options.renewal_period(), Duration::from_millis(333));

        let options =
            LeaseOptions::with_heartbeat_divisor(Duration::from_millis(1001), 2).unwrap();
        assert_eq!(options.renewal_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(LeaseOptions::from_millis(0).is_err());
        // 2ms / 3 rounds down to zero
        assert!(LeaseOptions::from_millis(2).is_err());
        assert!(LeaseOptions::with_heartbeat_divisor(Duration::from_secs(1), 1).is_err());

        let options = LeaseOptions::from_millis(1000).unwrap();
        assert!(
            options
                .clone()
                .with_renewal_period(Duration::from_millis(1000))
                .is_err()
        );
        assert!(
            options
                .with_renewal_period(Duration::from_millis(100))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_renewal_extends_expiry() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 300);
        store.insert_raw(record.clone());

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(180)).await;
        state.stop_renewal().await;

        assert!(state.is_valid());
        assert!(state.renewals.load(Ordering::SeqCst) >= 2);
        assert!(state.expires_at() > record.expires_at);

        let stored = store.snapshot("k").unwrap();
        assert_eq!(stored.fence_token, "t1");
        assert_eq!(stored.expires_at, state.expires_at());
        assert_eq!(*state.latest.lock(), stored);
    }

    #[tokio::test]
    async fn test_renewal_stops_when_token_replaced() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 300);
        store.insert_raw(LockRecord::new("k", "someone-else", "node-b", 300));

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!state.is_valid());
        assert_eq!(store.snapshot("k").unwrap().fence_token, "someone-else");

        // Loop already exited; stopping is a no-op
        state.stop_renewal().await;
    }

    #[tokio::test]
    async fn test_renewal_survives_transient_failures() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 1000);
        store.insert_raw(record.clone());

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(50));

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(160)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_millis(120)).await;
        state.stop_renewal().await;

        assert!(state.is_valid());
        assert!(state.renewals.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_renewal_gives_up_after_expiry() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 150);
        store.insert_raw(record.clone());
        store.set_available(false);

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!state.is_valid());
        state.stop_renewal().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_renewal() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 300);
        store.insert_raw(record.clone());

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(20));
        let handle = LeaseHandle::new(state.clone(), &LeaseOptions::default(), Weak::new());
        drop(handle);

        let ops = store.operation_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.operation_count(), ops);
        assert!(!state.abort_renewal());
    }

    #[tokio::test]
    async fn test_dropping_handle_leaves_active_set() {
        let record = LockRecord::new("k", "t1", "node-a", 300);
        let state = Arc::new(LeaseState::new(&record));
        let active = Arc::new(ActiveLeases::new());
        active.insert(record.fence_token.clone(), state.clone());
        active.insert("t2".to_string(), state.clone());

        let handle = LeaseHandle::new(state, &LeaseOptions::default(), Arc::downgrade(&active));
        drop(handle);
        assert_eq!(active.len(), 1);
        assert!(!active.contains_key("t1"));
    }

    #[tokio::test]
    async fn test_restarted_renewal_resumes_from_latest_record() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("k", "t1", "node-a", 300);
        store.insert_raw(record.clone());

        let state = Arc::new(LeaseState::new(&record));
        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(80)).await;
        state.stop_renewal().await;
        let renewals = state.renewals.load(Ordering::SeqCst);
        assert!(renewals >= 1);

        state.start_renewal(Arc::new(store.clone()), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(80)).await;
        state.stop_renewal().await;

        assert!(state.is_valid());
        assert!(state.renewals.load(Ordering::SeqCst) > renewals);
        let stored = store.snapshot("k").unwrap();
        assert_eq!(stored.renewal_count, state.renewals.load(Ordering::SeqCst));
    }
}
