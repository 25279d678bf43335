//! Latch Lock - Lease-based exclusive locks for resumable uploads
//!
//! This crate provides:
//! - `LeaseLockClient`: fail-fast acquisition, background renewal and fenced release
//! - `UploadLocker`: the upload-id facade implementing the `Locker` capability
//! - `LockerConfig`: file and environment configuration
//! - Lock metrics through the `metrics` facade

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod locker;
pub mod metrics;
pub mod registry;

pub use client::LeaseLockClient;
pub use crate::config::LockerConfig;
pub use error::{LeaseError, LockerError};
pub use lease::{LeaseHandle, LeaseOptions};
pub use locker::{Locker, UploadLock, UploadLocker};
pub use crate::metrics::init_metrics;
pub use registry::LockRegistry;

// Store types callers need to construct a locker
pub use latch_store::{CapacityMode, LockRecordStore, MemoryLockStore, StoreError};

#[cfg(feature = "dynamodb")]
pub use latch_store::{DynamoLockStore, DynamoStoreConfig};
