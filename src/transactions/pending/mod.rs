//! Barrier making a transaction wait for transactions of older topologies to
//! release their backup locks on the same keys.

mod barrier;

pub use barrier::{DefaultPendingLockManager, PendingLockWait};

use crate::Result;
use std::sync::Arc;
use std::time::Duration;

pub type PendingLockListener = Box<dyn FnOnce() + Send + 'static>;

pub trait PendingLockPromise: Send + Sync {
    /// `true` once nothing is pending anymore, or the wait timed out.
    fn is_ready(&self) -> bool;

    /// Runs once, when the promise becomes ready.
    fn add_listener(&self, listener: PendingLockListener);

    fn has_timed_out(&self) -> bool;

    /// Part of the original timeout still left for the lock acquisition itself.
    fn remaining_timeout(&self) -> Duration;

    /// Block until ready; returns the remaining timeout.
    fn await_pending(&self) -> Result<Duration>;
}

/// Promise with nothing to wait for.
#[derive(Clone, Copy, Debug)]
pub struct ReadyPendingLockPromise {
    remaining: Duration,
}

impl ReadyPendingLockPromise {
    pub fn new(remaining: Duration) -> ReadyPendingLockPromise {
        ReadyPendingLockPromise { remaining }
    }
}

impl PendingLockPromise for ReadyPendingLockPromise {
    fn is_ready(&self) -> bool {
        true
    }

    fn add_listener(&self, listener: PendingLockListener) {
        listener()
    }

    fn has_timed_out(&self) -> bool {
        false
    }

    fn remaining_timeout(&self) -> Duration {
        self.remaining
    }

    fn await_pending(&self) -> Result<Duration> {
        Ok(self.remaining)
    }
}

pub trait PendingLockManager<K, Tx>: Send + Sync {
    fn check_pending_transactions_for_keys(
        &self,
        requester: &Tx,
        keys: &[K],
        timeout: Duration,
    ) -> Arc<dyn PendingLockPromise>;

    fn check_pending_transactions_for_key(
        &self,
        requester: &Tx,
        key: &K,
        timeout: Duration,
    ) -> Arc<dyn PendingLockPromise> {
        self.check_pending_transactions_for_keys(requester, std::slice::from_ref(key), timeout)
    }

    /// Blocking variant of [`PendingLockManager::check_pending_transactions_for_key`].
    fn await_pending_transactions_for_key(
        &self,
        requester: &Tx,
        key: &K,
        timeout: Duration,
    ) -> Result<Duration> {
        self.check_pending_transactions_for_key(requester, key, timeout)
            .await_pending()
    }

    /// Blocking variant of [`PendingLockManager::check_pending_transactions_for_keys`].
    fn await_pending_transactions_for_all_keys(
        &self,
        requester: &Tx,
        keys: &[K],
        timeout: Duration,
    ) -> Result<Duration> {
        self.check_pending_transactions_for_keys(requester, keys, timeout)
            .await_pending()
    }
}

/// For caches without topology-aware waiting.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpPendingLockManager;

impl<K, Tx> PendingLockManager<K, Tx> for NoOpPendingLockManager {
    fn check_pending_transactions_for_keys(
        &self,
        _requester: &Tx,
        _keys: &[K],
        timeout: Duration,
    ) -> Arc<dyn PendingLockPromise> {
        Arc::new(ReadyPendingLockPromise::new(timeout))
    }
}
