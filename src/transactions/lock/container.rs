use crate::hash::hash_key;
use crate::transactions::lock::row_lock::{KeyLockPromise, RowLock};
use crate::transactions::lock::{DeadlockChecker, LockKey, LockOwner};
use dashmap::DashMap;
use std::fmt::Write;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Maps keys to [`RowLock`]s.
pub trait LockContainer<K: LockKey, O: LockOwner>: Send + Sync {
    fn acquire(&self, key: &K, owner: O, timeout: Duration) -> KeyLockPromise<K, O>;

    fn get(&self, key: &K) -> Option<Arc<RowLock<O>>>;

    fn release(&self, key: &K, owner: &O);

    /// Number of locks currently in the container.
    fn size(&self) -> usize;

    /// Number of locks with a holder.
    fn num_held(&self) -> usize;

    fn is_locked(&self, key: &K) -> bool {
        self.get(key).map_or(false, |lock| lock.is_locked())
    }

    fn owner(&self, key: &K) -> Option<O> {
        self.get(key).and_then(|lock| lock.owner())
    }

    fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>);

    fn print_lock_info(&self) -> String;
}

/// One lock per key, created on first acquisition and dropped once nobody
/// holds or waits for it.
pub struct PerKeyLockContainer<K, O> {
    lock_map: Arc<DashMap<K, Arc<RowLock<O>>>>,
}

impl<K: LockKey, O: LockOwner> PerKeyLockContainer<K, O> {
    pub fn new() -> PerKeyLockContainer<K, O> {
        PerKeyLockContainer {
            lock_map: Arc::new(DashMap::with_capacity(16)),
        }
    }

    fn create_lock(lock_map: Weak<DashMap<K, Arc<RowLock<O>>>>, key: K) -> RowLock<O> {
        RowLock::with_release_hook(Box::new(move || {
            if let Some(lock_map) = lock_map.upgrade() {
                lock_map.remove_if(&key, |_, lock| lock.is_empty());
            }
        }))
    }
}

impl<K: LockKey, O: LockOwner> Default for PerKeyLockContainer<K, O> {
    fn default() -> Self {
        PerKeyLockContainer::new()
    }
}

impl<K: LockKey, O: LockOwner> LockContainer<K, O> for PerKeyLockContainer<K, O> {
    fn acquire(&self, key: &K, owner: O, timeout: Duration) -> KeyLockPromise<K, O> {
        // Enqueue while holding the entry so that the release hook cannot drop
        // the lock between lookup and enqueue. Listeners run after leaving it.
        let (lock, request, granted) = {
            let entry = self.lock_map.entry(key.clone()).or_insert_with(|| {
                Arc::new(Self::create_lock(
                    Arc::downgrade(&self.lock_map),
                    key.clone(),
                ))
            });
            let lock = entry.value().clone();
            let (request, granted) = lock.acquire_deferred(owner, timeout);
            (lock, request, granted)
        };
        if let Some(granted) = granted {
            lock.notify_granted(&granted);
        }
        KeyLockPromise::new(key.clone(), lock, request)
    }

    fn get(&self, key: &K) -> Option<Arc<RowLock<O>>> {
        self.lock_map.get(key).map(|entry| entry.value().clone())
    }

    fn release(&self, key: &K, owner: &O) {
        // never call into the lock while holding a map guard
        let lock = match self.get(key) {
            Some(lock) => lock,
            None => return,
        };
        lock.release(owner);
    }

    fn size(&self) -> usize {
        self.lock_map.len()
    }

    fn num_held(&self) -> usize {
        self.lock_map
            .iter()
            .filter(|entry| entry.value().is_locked())
            .count()
    }

    fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>) {
        let locks: Vec<Arc<RowLock<O>>> = self
            .lock_map
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for lock in locks {
            lock.deadlock_check(checker);
        }
    }

    fn print_lock_info(&self) -> String {
        let mut info = String::new();
        for entry in self.lock_map.iter() {
            let lock = entry.value();
            let _ = writeln!(
                info,
                "key {:?}: owner {:?}, {} waiting",
                entry.key(),
                lock.owner(),
                lock.num_waiting()
            );
        }
        info
    }
}

/// Fixed pool of locks shared by all keys. A key always maps to the same
/// stripe, unrelated keys on one stripe contend with each other.
pub struct StripedLockContainer<K, O> {
    stripes: Vec<Arc<RowLock<O>>>,
    _key: PhantomData<fn(&K)>,
}

impl<K: LockKey, O: LockOwner> StripedLockContainer<K, O> {
    pub fn new(concurrency_level: usize) -> StripedLockContainer<K, O> {
        let num_stripes = concurrency_level.max(1);
        StripedLockContainer {
            stripes: (0..num_stripes).map(|_| Arc::new(RowLock::new())).collect(),
            _key: PhantomData,
        }
    }

    #[inline]
    fn stripe_index(&self, key: &K) -> usize {
        hash_key(key) as usize % self.stripes.len()
    }

    #[inline]
    fn stripe(&self, key: &K) -> &Arc<RowLock<O>> {
        &self.stripes[self.stripe_index(key)]
    }
}

impl<K: LockKey, O: LockOwner> LockContainer<K, O> for StripedLockContainer<K, O> {
    fn acquire(&self, key: &K, owner: O, timeout: Duration) -> KeyLockPromise<K, O> {
        let lock = self.stripe(key).clone();
        let request = lock.acquire(owner, timeout);
        KeyLockPromise::new(key.clone(), lock, request)
    }

    fn get(&self, key: &K) -> Option<Arc<RowLock<O>>> {
        Some(self.stripe(key).clone())
    }

    fn release(&self, key: &K, owner: &O) {
        self.stripe(key).release(owner);
    }

    fn size(&self) -> usize {
        self.stripes.len()
    }

    fn num_held(&self) -> usize {
        self.stripes.iter().filter(|lock| lock.is_locked()).count()
    }

    fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>) {
        for lock in &self.stripes {
            lock.deadlock_check(checker);
        }
    }

    fn print_lock_info(&self) -> String {
        let mut info = String::new();
        for (i, lock) in self.stripes.iter().enumerate() {
            if lock.is_locked() {
                let _ = writeln!(
                    info,
                    "stripe {}: owner {:?}, {} waiting",
                    i,
                    lock.owner(),
                    lock.num_waiting()
                );
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use crate::transactions::lock::container::{
        LockContainer, PerKeyLockContainer, StripedLockContainer,
    };
    use crate::transactions::lock::{LockPromise, LockState};
    use std::time::Duration;

    const LONG: Duration = Duration::from_secs(30);

    #[test]
    fn test_per_key_discards_empty_locks() {
        let container = PerKeyLockContainer::new();
        let p1 = container.acquire(&"k1", 1, LONG);
        container.acquire(&"k2", 1, LONG);
        let p3 = container.acquire(&"k1", 2, LONG);
        assert_eq!(LockState::Acquired, p1.state());
        assert_eq!(LockState::Waiting, p3.state());
        assert_eq!(2, container.size());
        assert_eq!(2, container.num_held());

        container.release(&"k1", &1);
        assert_eq!(LockState::Acquired, p3.state());
        assert_eq!(Some(2), container.owner(&"k1"));
        assert_eq!(2, container.size());

        container.release(&"k1", &2);
        container.release(&"k2", &1);
        assert_eq!(0, container.size());
        assert!(!container.is_locked(&"k1"));

        // unknown key and owner
        container.release(&"k3", &1);
        assert_eq!(0, container.size());
    }

    #[test]
    fn test_per_key_discards_after_cancel() {
        let container = PerKeyLockContainer::new();
        container.acquire(&"k", 1, LONG);
        let waiter = container.acquire(&"k", 2, LONG);
        container.release(&"k", &1);
        assert_eq!(LockState::Acquired, waiter.state());

        let other = container.acquire(&"k2", 3, LONG);
        let blocked = container.acquire(&"k2", 4, LONG);
        blocked.cancel(LockState::TimedOut).unwrap();
        assert_eq!(LockState::TimedOut, blocked.state());
        container.release(&"k2", &3);
        assert_eq!(LockState::Released, other.state());
        assert!(!container.is_locked(&"k2"));
        // the failed request keeps the lock until its owner sees it
        assert_eq!(2, container.size());
        assert!(blocked.lock().is_err());
        assert!(container.get(&"k2").is_none());
        assert_eq!(1, container.size());
    }

    #[test]
    fn test_per_key_deadlock_check() {
        let container = PerKeyLockContainer::new();
        container.acquire(&"a", 1, LONG);
        container.acquire(&"b", 2, LONG);
        let p1 = container.acquire(&"b", 1, LONG);
        let p2 = container.acquire(&"a", 2, LONG);

        container.deadlock_check(&|pending: &i32, current: &i32| pending > current);
        assert_eq!(LockState::Waiting, p1.state());
        assert_eq!(LockState::Deadlocked, p2.state());

        container.release(&"b", &2);
        assert_eq!(LockState::Acquired, p1.state());
        assert!(container.print_lock_info().contains("\"b\""));
    }

    #[test]
    fn test_striped_size_is_fixed() {
        let container = StripedLockContainer::new(7);
        assert_eq!(7, container.size());
        for i in 0..1000 {
            container.acquire(&i, i, LONG);
            assert_eq!(7, container.size());
        }
        assert!(container.num_held() <= 7);
        for i in 0..1000 {
            container.release(&i, &i);
        }
        assert_eq!(7, container.size());
        assert_eq!(0, container.num_held());
    }

    #[test]
    fn test_striped_shares_locks() {
        let container: StripedLockContainer<u32, &str> = StripedLockContainer::new(1);
        let p1 = container.acquire(&1, "tx1", LONG);
        let p2 = container.acquire(&2, "tx2", LONG);
        assert_eq!(LockState::Acquired, p1.state());
        assert_eq!(LockState::Waiting, p2.state());
        assert!(container.is_locked(&3));
        assert_eq!(Some("tx1"), container.owner(&2));

        // same owner on another key of the same stripe reuses its request
        let p3 = container.acquire(&3, "tx1", LONG);
        assert_eq!(LockState::Acquired, p3.state());

        container.release(&1, &"tx1");
        assert_eq!(LockState::Acquired, p2.state());
        assert!(container.print_lock_info().contains("stripe 0"));
    }

    #[test]
    fn test_striped_zero_level() {
        let container: StripedLockContainer<u32, u32> = StripedLockContainer::new(0);
        assert_eq!(1, container.size());
    }
}
