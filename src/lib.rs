//! Per-key lock engine for a transactional in-memory data grid.
//!
//! Locks are granted to arbitrary owners (transactions or single operations)
//! without blocking the calling thread: every acquisition returns a promise
//! that callers may poll, listen to, or block on.

#[macro_use]
extern crate log;

pub mod error;
mod hash;
pub mod options;
pub mod scheduler;
pub mod signal;
pub mod transactions;

pub use transactions::lock::point_lock_manager::PointLockManager;
pub use transactions::lock::{DeadlockChecker, LockManager, LockPromise, LockState};
pub use transactions::pending::{
    DefaultPendingLockManager, NoOpPendingLockManager, PendingLockManager, PendingLockPromise,
};

pub type Result<T> = std::result::Result<T, error::LockError>;
