//! Tandem Consistency - keeps registry nodes in step
//!
//! This crate provides:
//! - Local and cluster-wide read/write locks on packages and users
//! - Signed sync tokens and encrypted content transfer between nodes

#![allow(clippy::result_large_err)]

pub mod lock;
pub mod sync;

// Re-export lock types
pub use lock::{
    DEFAULT_ACQUIRE_TIMEOUT, EntryState, LocalLockManager, LockQueueEntry, LockScope, LockService,
    LockTarget, LockTargetResolver, LockType, OperationDescriptor, RemoteLockCoordinator,
    package_name, target_for,
};

// Re-export sync types
pub use sync::{SyncClaims, SyncOutcome, SyncProtocol};
