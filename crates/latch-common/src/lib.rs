//! Latch Common - Shared types, constants, and utilities
//!
//! This crate provides the foundational pieces used across all Latch components:
//! - Base error type for argument and configuration problems
//! - Lease defaults shared by the lock client and the setup tool
//! - Time and identity helpers

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::LatchError;
pub use utils::{current_timestamp, default_owner_name, new_fence_token};

/// Default lease duration in milliseconds (one minute)
pub const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;

/// A lease is renewed `HEARTBEAT_DIVISOR` times per lease window
pub const HEARTBEAT_DIVISOR: u32 = 3;

/// Default allowance for wall-clock drift between lock holders, in milliseconds
pub const DEFAULT_CLOCK_SKEW_TOLERANCE_MS: u64 = 1_000;

/// Partition key attribute of the lock table
pub const PARTITION_KEY: &str = "key";

/// Default AWS region for the lock table
pub const DEFAULT_REGION: &str = "us-east-1";
