//! Upload locker
//!
//! Maps upload ids to leases for an upload server. Contention and
//! ownership problems surface as [`LockerError::FileLocked`] and
//! [`LockerError::LockNotHeld`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use latch_common::LatchError;
use latch_store::{CapacityMode, LockRecordStore, StoreError};

use crate::client::LeaseLockClient;
use crate::error::LockerError;
use crate::lease::LeaseOptions;
use crate::registry::LockRegistry;

/// Locking capability expected by the upload server
#[async_trait]
pub trait Locker: Send + Sync {
    /// Take the exclusive lock for an upload, failing fast if it is held
    async fn lock_upload(&self, id: &str) -> Result<(), LockerError>;

    /// Give up a lock previously taken through this locker
    async fn unlock_upload(&self, id: &str) -> Result<(), LockerError>;
}

pub struct UploadLocker {
    client: LeaseLockClient,
    options: LeaseOptions,
    registry: LockRegistry,
}

impl UploadLocker {
    /// Locker with the default one-minute lease
    pub fn new(store: Arc<dyn LockRecordStore>) -> Self {
        Self::with_client(LeaseLockClient::new(store), LeaseOptions::default())
    }

    pub fn with_lease_duration(
        store: Arc<dyn LockRecordStore>,
        lease_duration_ms: u64,
    ) -> Result<Self, LatchError> {
        let options = LeaseOptions::from_millis(lease_duration_ms)?;
        Ok(Self::with_client(LeaseLockClient::new(store), options))
    }

    pub fn with_client(client: LeaseLockClient, options: LeaseOptions) -> Self {
        Self {
            client,
            options,
            registry: LockRegistry::new(),
        }
    }

    /// Connect to the DynamoDB table named in `config`
    #[cfg(feature = "dynamodb")]
    pub async fn from_config(config: &crate::config::LockerConfig) -> Result<Self, LatchError> {
        let options = config.lease_options()?;
        let store = latch_store::DynamoLockStore::connect(&config.store_config()?).await;
        let client = LeaseLockClient::new(Arc::new(store))
            .with_clock_skew_tolerance(config.clock_skew_tolerance());

        info!(
            table = %config.table_name,
            region = %config.region,
            owner = %client.owner(),
            "Upload locker connected"
        );
        Ok(Self::with_client(client, options))
    }

    pub fn client(&self) -> &LeaseLockClient {
        &self.client
    }

    pub fn lease_options(&self) -> &LeaseOptions {
        &self.options
    }

    /// Number of uploads currently locked through this locker
    pub fn held_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Provision the lock table behind this locker's store
    pub async fn create_table(&self, capacity: CapacityMode) -> Result<(), StoreError> {
        self.client.store().create_table(capacity).await
    }

    /// Per-upload lock handle
    pub fn new_lock(self: &Arc<Self>, id: impl Into<String>) -> UploadLock {
        UploadLock {
            locker: self.clone(),
            id: id.into(),
        }
    }

    /// Release every lock held through this locker
    pub async fn close(&self) {
        let closed = self.client.close_all().await;
        let dropped = self.registry.drain().len();
        debug!(closed = closed, dropped = dropped, "Upload locker closed");
    }
}

#[async_trait]
impl Locker for UploadLocker {
    async fn lock_upload(&self, id: &str) -> Result<(), LockerError> {
        let handle = match self.client.acquire(id, &self.options).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(upload_id = %id, "Failed to lock upload: {}", e);
                return Err(LockerError::FileLocked);
            }
        };

        // Only reachable if an earlier lease for this id was reclaimed; dropping
        // the old handle untracks it
        if let Some(previous) = self.registry.track(id, handle) {
            debug!(
                upload_id = %id,
                fence_token = %previous.fence_token(),
                "Replaced stale lease handle"
            );
        }
        Ok(())
    }

    async fn unlock_upload(&self, id: &str) -> Result<(), LockerError> {
        let Some(handle) = self.registry.take(id) else {
            return Err(LockerError::LockNotHeld);
        };

        match self.client.release(&handle).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(upload_id = %id, "Lease was lost before unlock");
                Err(LockerError::LockNotHeld)
            }
            Err(e) => {
                // Still held; keep the handle so the unlock can be retried
                self.registry.track(id, handle);
                Err(e.into())
            }
        }
    }
}

/// Lock for a single upload, bound to the locker that created it
#[derive(Clone)]
pub struct UploadLock {
    locker: Arc<UploadLocker>,
    id: String,
}

impl UploadLock {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> Result<(), LockerError> {
        self.locker.lock_upload(&self.id).await
    }

    pub async fn unlock(&self) -> Result<(), LockerError> {
        self.locker.unlock_upload(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use latch_store::{LockRecord, MemoryLockStore};

    fn locker(store: &MemoryLockStore, owner: &str) -> UploadLocker {
        let client = LeaseLockClient::new(Arc::new(store.clone()))
            .with_owner(owner)
            .with_clock_skew_tolerance(Duration::ZERO);
        UploadLocker::with_client(client, LeaseOptions::default())
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        a.lock_upload("one").await.unwrap();
        assert!(a.is_held("one"));
        assert_eq!(a.held_count(), 1);

        a.unlock_upload("one").await.unwrap();
        assert_eq!(a.held_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_contention_maps_to_file_locked() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");
        let b = locker(&store, "node-b");

        a.lock_upload("one").await.unwrap();
        assert!(matches!(a.lock_upload("one").await, Err(LockerError::FileLocked)));
        assert!(matches!(b.lock_upload("one").await, Err(LockerError::FileLocked)));

        // The failed attempt left A's registry entry alone
        a.unlock_upload("one").await.unwrap();
        b.lock_upload("one").await.unwrap();
        b.close().await;
    }

    #[tokio::test]
    async fn test_store_failure_on_lock_maps_to_file_locked() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        store.set_available(false);
        assert!(matches!(a.lock_upload("one").await, Err(LockerError::FileLocked)));
        assert_eq!(a.held_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");
        let b = locker(&store, "node-b");

        assert!(matches!(a.unlock_upload("one").await, Err(LockerError::LockNotHeld)));

        // Held by someone else is still "not held" for this locker
        a.lock_upload("one").await.unwrap();
        assert!(matches!(b.unlock_upload("one").await, Err(LockerError::LockNotHeld)));
        assert_eq!(store.len(), 1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_unlock_after_takeover() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        a.lock_upload("one").await.unwrap();
        store.insert_raw(LockRecord::new("one", "foreign-token", "node-b", 60_000));

        assert!(matches!(a.unlock_upload("one").await, Err(LockerError::LockNotHeld)));
        assert_eq!(store.snapshot("one").unwrap().owner, "node-b");
    }

    #[tokio::test]
    async fn test_unlock_store_error_passes_through() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        a.lock_upload("one").await.unwrap();
        store.set_available(false);
        let err = a.unlock_upload("one").await.unwrap_err();
        assert!(matches!(err, LockerError::Store(StoreError::Transport(_))));
        assert!(a.is_held("one"));
    }

    #[tokio::test]
    async fn test_unlock_retry_after_store_recovers() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");
        let b = locker(&store, "node-b");

        a.lock_upload("one").await.unwrap();
        store.set_available(false);
        assert!(matches!(a.unlock_upload("one").await, Err(LockerError::Store(_))));
        store.set_available(true);

        // The record still blocks others until the retried unlock succeeds
        assert!(matches!(b.lock_upload("one").await, Err(LockerError::FileLocked)));
        a.unlock_upload("one").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(a.client().active_count(), 0);
        b.lock_upload("one").await.unwrap();
        b.close().await;
    }

    #[tokio::test]
    async fn test_replaced_lease_is_untracked() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        a.lock_upload("one").await.unwrap();
        // The first lease's record is swept away before it is unlocked
        let stale = store.snapshot("one").unwrap();
        store.delete_if("one", &stale.fence_token).await.unwrap();

        a.lock_upload("one").await.unwrap();
        assert_eq!(a.held_count(), 1);
        assert_eq!(a.client().active_count(), 1);

        a.unlock_upload("one").await.unwrap();
        assert_eq!(a.client().active_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_all() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");

        a.lock_upload("one").await.unwrap();
        a.lock_upload("two").await.unwrap();
        a.close().await;

        assert_eq!(a.held_count(), 0);
        assert_eq!(a.client().active_count(), 0);
        assert!(store.is_empty());
        assert!(matches!(a.unlock_upload("one").await, Err(LockerError::LockNotHeld)));
    }

    #[tokio::test]
    async fn test_upload_lock_handle() {
        let store = MemoryLockStore::new();
        let a = Arc::new(locker(&store, "node-a"));

        let lock = a.new_lock("one");
        assert_eq!(lock.id(), "one");
        lock.lock().await.unwrap();
        assert!(matches!(a.new_lock("one").lock().await, Err(LockerError::FileLocked)));
        lock.unlock().await.unwrap();
        assert!(matches!(lock.unlock().await, Err(LockerError::LockNotHeld)));
    }

    #[test]
    fn test_constructors() {
        let store: Arc<dyn LockRecordStore> = Arc::new(MemoryLockStore::new());

        let locker = UploadLocker::new(store.clone());
        assert_eq!(locker.lease_options().lease_duration(), Duration::from_secs(60));

        let locker = UploadLocker::with_lease_duration(store.clone(), 1500).unwrap();
        assert_eq!(locker.lease_options().renewal_period(), Duration::from_millis(500));

        assert!(UploadLocker::with_lease_duration(store, 0).is_err());
    }

    #[tokio::test]
    async fn test_create_table_delegates_to_store() {
        let store = MemoryLockStore::new();
        let a = locker(&store, "node-a");
        a.create_table(CapacityMode::OnDemand).await.unwrap();

        store.set_available(false);
        assert!(a.create_table(CapacityMode::OnDemand).await.is_err());
    }
}
