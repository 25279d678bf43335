//! Latch Store - Lock records and the conditional-write stores that hold them
//!
//! This crate provides:
//! - The lock record data model
//! - The `LockRecordStore` port (conditional put, read, conditional delete)
//! - An in-memory store shared between lockers of one process
//! - A DynamoDB-backed store (feature `dynamodb`)

pub mod error;
pub mod memory;
pub mod record;
pub mod traits;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use error::StoreError;
pub use memory::MemoryLockStore;
pub use record::LockRecord;
pub use traits::{CapacityMode, LockRecordStore, Precondition, PutOutcome, WriteOutcome};

#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoLockStore, DynamoStoreConfig};
