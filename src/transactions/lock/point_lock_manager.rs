use crate::options::{ContainerType, LockManagerOptions};
use crate::scheduler::{TimeoutScheduler, TimerThread};
use crate::transactions::lock::composite::CompositeLockPromise;
use crate::transactions::lock::container::{
    LockContainer, PerKeyLockContainer, StripedLockContainer,
};
use crate::transactions::lock::{
    DeadlockChecker, LockKey, LockManager, LockOwner, LockPromise, LockState, NoOpLockPromise,
};
use crate::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lock manager over point (per-key) locks.
pub struct PointLockManager<K, O> {
    container: Box<dyn LockContainer<K, O>>,
    scheduler: Arc<dyn TimeoutScheduler>,
    /// Serializes multi-key registration so that two owners never interleave
    /// their per-key enqueues.
    lock_all_guard: Mutex<()>,
    default_timeout: Duration,
}

impl<K: LockKey, O: LockOwner> PointLockManager<K, O> {
    /// Open a lock manager with its own timeout scheduler thread.
    pub fn open(options: LockManagerOptions) -> Result<PointLockManager<K, O>> {
        let scheduler = Arc::new(TimerThread::start()?);
        Ok(Self::with_scheduler(options, scheduler))
    }

    pub fn with_scheduler(
        options: LockManagerOptions,
        scheduler: Arc<dyn TimeoutScheduler>,
    ) -> PointLockManager<K, O> {
        let container: Box<dyn LockContainer<K, O>> = match options.container_type {
            ContainerType::PerKey => Box::new(PerKeyLockContainer::new()),
            ContainerType::Striped { concurrency_level } => {
                Box::new(StripedLockContainer::new(concurrency_level))
            }
        };
        PointLockManager {
            container,
            scheduler,
            lock_all_guard: Mutex::new(()),
            default_timeout: options.default_timeout,
        }
    }

    #[inline]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn scheduler(&self) -> &Arc<dyn TimeoutScheduler> {
        &self.scheduler
    }

    /// [`LockManager::lock`] with the configured default timeout.
    pub fn lock_default(&self, key: &K, owner: O) -> Arc<dyn LockPromise> {
        self.lock(key, owner, self.default_timeout)
    }

    /// [`LockManager::lock_all`] with the configured default timeout.
    pub fn lock_all_default(&self, keys: &[K], owner: O) -> Arc<dyn LockPromise> {
        self.lock_all(keys, owner, self.default_timeout)
    }

    /// Number of locks in the container: live keys, or stripes.
    pub fn size(&self) -> usize {
        self.container.size()
    }

    pub fn print_lock_info(&self) -> String {
        self.container.print_lock_info()
    }

    /// Cancel `promise` with TIMED_OUT after `timeout`, unless it resolves first.
    fn schedule_lock_timeout(&self, promise: Arc<dyn LockPromise>, timeout: Duration) {
        if promise.is_available() {
            return;
        }
        let target = promise.clone();
        let task = self.scheduler.schedule(
            timeout,
            Box::new(move || {
                if let Err(e) = target.cancel(LockState::TimedOut) {
                    warn!("{}", e);
                }
            }),
        );
        promise.add_listener(Box::new(move |_| {
            task.cancel();
        }));
    }
}

fn distinct_keys<K: LockKey>(keys: &[K]) -> Vec<K> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|key| seen.insert(*key))
        .cloned()
        .collect()
}

impl<K: LockKey, O: LockOwner> LockManager<K, O> for PointLockManager<K, O> {
    fn lock(&self, key: &K, owner: O, timeout: Duration) -> Arc<dyn LockPromise> {
        trace!("lock({:?}, {:?}, {:?})", key, owner, timeout);
        let promise: Arc<dyn LockPromise> =
            Arc::new(self.container.acquire(key, owner, timeout));
        self.schedule_lock_timeout(promise.clone(), timeout);
        promise
    }

    fn lock_all(&self, keys: &[K], owner: O, timeout: Duration) -> Arc<dyn LockPromise> {
        let keys = distinct_keys(keys);
        match keys.len() {
            0 => return Arc::new(NoOpLockPromise),
            1 => return self.lock(&keys[0], owner, timeout),
            _ => {}
        }

        trace!("lock_all({:?}, {:?}, {:?})", keys, owner, timeout);
        let members = {
            let _guard = self.lock_all_guard.lock().unwrap();
            keys.iter()
                .map(|key| Arc::new(self.container.acquire(key, owner.clone(), timeout)))
                .collect()
        };
        let composite: Arc<dyn LockPromise> = CompositeLockPromise::new(members, timeout);
        self.schedule_lock_timeout(composite.clone(), timeout);
        composite
    }

    fn unlock(&self, key: &K, owner: &O) {
        trace!("unlock({:?}, {:?})", key, owner);
        self.container.release(key, owner);
    }

    fn is_locked(&self, key: &K) -> bool {
        self.container.is_locked(key)
    }

    fn owner(&self, key: &K) -> Option<O> {
        self.container.owner(key)
    }

    fn num_locks_held(&self) -> usize {
        self.container.num_held()
    }

    fn num_locks_available(&self) -> usize {
        self.container.size().saturating_sub(self.container.num_held())
    }

    fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>) {
        self.container.deadlock_check(checker);
    }
}

#[cfg(test)]
mod tests {
    use crate::error::LockError;
    use crate::options::LockManagerOptions;
    use crate::transactions::lock::point_lock_manager::{distinct_keys, PointLockManager};
    use crate::transactions::lock::{LockManager, LockPromise, LockState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const LONG: Duration = Duration::from_secs(30);

    fn create_manager(options: LockManagerOptions) -> PointLockManager<&'static str, u32> {
        let _ = env_logger::try_init();
        PointLockManager::open(options).unwrap()
    }

    #[test]
    fn test_distinct_keys() {
        assert_eq!(vec!["b", "a", "c"], distinct_keys(&["b", "a", "b", "c", "a"]));
        assert!(distinct_keys::<u8>(&[]).is_empty());
    }

    #[test]
    fn test_lock_unlock() {
        let manager = create_manager(LockManagerOptions::default());
        let p1 = manager.lock(&"k", 1, LONG);
        assert!(p1.is_available());
        p1.lock().unwrap();
        assert!(manager.is_locked(&"k"));
        assert!(manager.owns_lock(&"k", &1));
        assert_eq!(1, manager.num_locks_held());

        let p2 = manager.lock(&"k", 2, LONG);
        assert!(!p2.is_available());
        manager.unlock(&"k", &1);
        assert!(p2.is_available());
        p2.lock().unwrap();
        assert_eq!(Some(2), manager.owner(&"k"));

        manager.unlock(&"k", &2);
        // unknown owner is ignored
        manager.unlock(&"k", &3);
        assert!(!manager.is_locked(&"k"));
        assert_eq!(0, manager.size());
    }

    #[test]
    fn test_scheduled_timeout() {
        let manager = create_manager(LockManagerOptions::default());
        manager.lock(&"k", 1, LONG).lock().unwrap();

        let timed_out = Arc::new(AtomicBool::new(false));
        let t = timed_out.clone();
        let start = Instant::now();
        let timeout = Duration::from_millis(50);
        let p2 = manager.lock(&"k", 2, timeout);
        p2.add_listener(Box::new(move |state| {
            t.store(state == LockState::TimedOut, Ordering::SeqCst);
        }));

        // nobody polls the promise: only the scheduled task can time it out
        std::thread::sleep(Duration::from_millis(300));
        assert!(timed_out.load(Ordering::SeqCst));
        assert!(start.elapsed() >= timeout);
        assert_eq!(
            Err(LockError::Timeout {
                key: "\"k\"".to_owned(),
                owner: "2".to_owned()
            }),
            p2.lock()
        );
        assert!(manager.owns_lock(&"k", &1));
    }

    #[test]
    fn test_lock_all_no_keys() {
        let manager = create_manager(LockManagerOptions::default());
        let promise = manager.lock_all(&[], 1, LONG);
        assert!(promise.is_available());
        promise.lock().unwrap();
        assert_eq!(0, manager.num_locks_held());

        let promise = manager.lock_all(&["a", "a"], 1, LONG);
        promise.lock().unwrap();
        assert!(manager.owns_lock(&"a", &1));
    }

    #[test]
    fn test_lock_all() {
        let manager = create_manager(LockManagerOptions::default());
        manager.lock(&"b", 2, LONG).lock().unwrap();

        let promise = manager.lock_all(&["a", "b", "c"], 1, LONG);
        assert!(!promise.is_available());
        assert!(manager.owns_lock(&"a", &1));
        assert!(manager.owns_lock(&"c", &1));

        manager.unlock(&"b", &2);
        promise.lock().unwrap();
        for key in ["a", "b", "c"].iter() {
            assert!(manager.owns_lock(key, &1));
        }
        manager.unlock_all(&["a", "b", "c"], &1);
        assert_eq!(0, manager.num_locks_held());
    }

    #[test]
    fn test_lock_all_deadlock() {
        let manager = create_manager(LockManagerOptions::default());
        manager.lock(&"b", 2, LONG).lock().unwrap();
        manager.lock(&"c", 3, LONG).lock().unwrap();

        let promise = manager.lock_all(&["a", "b", "c"], 1, LONG);
        // owner 1 loses against owner 2 only
        manager.deadlock_check(&|pending: &u32, current: &u32| *pending == 1 && *current == 2);

        assert!(promise.is_available());
        assert_eq!(
            Err(LockError::Deadlock {
                key: "\"b\"".to_owned(),
                owner: "1".to_owned()
            }),
            promise.lock()
        );
        // acquired member is left to the caller
        assert!(manager.owns_lock(&"a", &1));
        // waiting member was cancelled
        manager.unlock(&"c", &3);
        assert!(!manager.is_locked(&"c"));

        manager.unlock_all(&["a", "b", "c"], &1);
        assert!(!manager.is_locked(&"a"));
        assert!(manager.owns_lock(&"b", &2));
    }

    #[test]
    fn test_striped_available() {
        let manager = create_manager(LockManagerOptions::striped(16));
        assert_eq!(16, manager.num_locks_available());
        manager.lock(&"a", 1, LONG).lock().unwrap();
        assert_eq!(1, manager.num_locks_held());
        assert_eq!(15, manager.num_locks_available());
        assert!(!manager.print_lock_info().is_empty());
        manager.unlock(&"a", &1);
        assert_eq!(16, manager.num_locks_available());
    }
}
