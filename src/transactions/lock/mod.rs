pub mod composite;
pub mod container;
pub mod point_lock_manager;
pub mod row_lock;

use crate::Result;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Key of a lock. Opaque to the engine apart from equality and hashing.
pub trait LockKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> LockKey for T {}

/// Identity requesting or holding a lock, typically a transaction.
pub trait LockOwner: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> LockOwner for T {}

/// State of one owner's request on one lock.
///
/// ```text
/// WAITING -> ACQUIRED | RELEASED | TIMED_OUT | DEADLOCKED
/// ACQUIRED -> RELEASED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockState {
    Waiting = 0,
    Acquired = 1,
    Released = 2,
    TimedOut = 3,
    Deadlocked = 4,
}

impl LockState {
    pub(crate) fn from_u8(value: u8) -> LockState {
        match value {
            0 => LockState::Waiting,
            1 => LockState::Acquired,
            2 => LockState::Released,
            3 => LockState::TimedOut,
            _ => LockState::Deadlocked,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LockState::Released | LockState::TimedOut | LockState::Deadlocked
        )
    }

    /// Only a timeout or a deadlock may cancel a waiting request.
    #[inline]
    pub fn is_cancel_reason(self) -> bool {
        matches!(self, LockState::TimedOut | LockState::Deadlocked)
    }
}

impl Default for LockState {
    fn default() -> Self {
        LockState::Waiting
    }
}

pub(crate) const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub type LockListener = Box<dyn FnOnce(LockState) + Send + 'static>;

/// Handle returned by every acquisition.
///
/// Listeners run exactly once, with [`LockState::Acquired`] or with the state
/// that made the acquisition fail. They may run on the thread completing the
/// request and must not block.
pub trait LockPromise: Send + Sync {
    /// `true` once the request is no longer waiting. Checks the deadline lazily.
    fn is_available(&self) -> bool;

    /// Block until the lock is acquired or the request fails.
    fn lock(&self) -> Result<()>;

    fn add_listener(&self, listener: LockListener);

    /// Cancel a waiting request with [`LockState::TimedOut`] or
    /// [`LockState::Deadlocked`]. Requests that already left the waiting state
    /// are unaffected.
    fn cancel(&self, cause: LockState) -> Result<()>;
}

/// Promise of an acquisition that needs nothing, e.g. locking an empty key set.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpLockPromise;

impl LockPromise for NoOpLockPromise {
    fn is_available(&self) -> bool {
        true
    }

    fn lock(&self) -> Result<()> {
        Ok(())
    }

    fn add_listener(&self, listener: LockListener) {
        listener(LockState::Acquired)
    }

    fn cancel(&self, _cause: LockState) -> Result<()> {
        Ok(())
    }
}

/// Decides whether `pending_owner`, queued behind `current_owner`, should give up.
///
/// The engine only asks; the comparison policy belongs to whoever creates the
/// owners.
pub trait DeadlockChecker<O>: Send + Sync {
    fn deadlock_detected(&self, pending_owner: &O, current_owner: &O) -> bool;
}

impl<O, F> DeadlockChecker<O> for F
where
    F: Fn(&O, &O) -> bool + Send + Sync,
{
    fn deadlock_detected(&self, pending_owner: &O, current_owner: &O) -> bool {
        self(pending_owner, current_owner)
    }
}

pub trait LockManager<K: LockKey, O: LockOwner> {
    fn lock(&self, key: &K, owner: O, timeout: Duration) -> Arc<dyn LockPromise>;

    fn lock_all(&self, keys: &[K], owner: O, timeout: Duration) -> Arc<dyn LockPromise>;

    fn unlock(&self, key: &K, owner: &O);

    fn unlock_all(&self, keys: &[K], owner: &O) {
        for key in keys {
            self.unlock(key, owner);
        }
    }

    fn is_locked(&self, key: &K) -> bool;

    fn owner(&self, key: &K) -> Option<O>;

    fn owns_lock(&self, key: &K, owner: &O) -> bool {
        self.owner(key).map_or(false, |o| o.eq(owner))
    }

    fn num_locks_held(&self) -> usize;

    fn num_locks_available(&self) -> usize;

    fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>);
}
