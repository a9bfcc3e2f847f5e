use kvlite_lock::error::LockError;
use kvlite_lock::options::LockManagerOptions;
use kvlite_lock::{LockManager, LockPromise, LockState, PointLockManager};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const LONG: Duration = Duration::from_secs(30);

fn create_manager(options: LockManagerOptions) -> PointLockManager<String, u64> {
    let _ = env_logger::try_init();
    PointLockManager::open(options).unwrap()
}

#[test]
fn test_fifo_grant_order() {
    let manager = create_manager(LockManagerOptions::default());
    let key = "k".to_owned();
    manager.lock(&key, 1, LONG).lock().unwrap();

    let promises: Vec<_> = (2..=5).map(|owner| manager.lock(&key, owner, LONG)).collect();
    for promise in &promises {
        assert!(!promise.is_available());
    }

    let granted = Arc::new(Mutex::new(vec![]));
    for (i, promise) in promises.iter().enumerate() {
        let granted = granted.clone();
        promise.add_listener(Box::new(move |state| {
            assert_eq!(LockState::Acquired, state);
            granted.lock().unwrap().push(i as u64 + 2);
        }));
    }

    for owner in 1..=5 {
        assert_eq!(Some(owner), manager.owner(&key));
        manager.unlock(&key, &owner);
    }
    assert_eq!(vec![2, 3, 4, 5], *granted.lock().unwrap());
    assert!(!manager.is_locked(&key));
    assert_eq!(0, manager.size());
}

#[test]
fn test_timeout_not_early() {
    let manager = create_manager(LockManagerOptions::default());
    let key = "k".to_owned();
    manager.lock(&key, 1, LONG).lock().unwrap();

    let timeout = Duration::from_millis(100);
    let start = Instant::now();
    let result = manager.lock(&key, 2, timeout).lock();
    assert!(start.elapsed() >= timeout);
    let err = result.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(
        "unable to acquire lock after timeout for key \"k\" and requestor 2",
        err.to_string()
    );
    assert!(manager.owns_lock(&key, &1));
    assert!(!manager.owns_lock(&key, &2));
}

#[test]
fn test_lock_all_partial_failure() {
    let manager = create_manager(LockManagerOptions::default());
    let (a, b) = ("a".to_owned(), "b".to_owned());
    manager.lock(&b, 2, LONG).lock().unwrap();

    let promise = manager.lock_all(&[a.clone(), b.clone()], 1, Duration::from_millis(100));
    assert_eq!(
        Err(LockError::Timeout {
            key: "\"b\"".to_owned(),
            owner: "1".to_owned()
        }),
        promise.lock()
    );
    // no rollback of the members already acquired
    assert!(manager.owns_lock(&a, &1));
    assert!(manager.owns_lock(&b, &2));

    manager.unlock_all(&[a.clone(), b.clone()], &1);
    assert!(!manager.is_locked(&a));
    assert!(manager.owns_lock(&b, &2));
}

#[test]
fn test_lock_all_member_released() {
    let manager = create_manager(LockManagerOptions::default());
    let (a, b) = ("a".to_owned(), "b".to_owned());
    manager.lock(&a, 2, LONG).lock().unwrap();
    manager.lock(&b, 3, LONG).lock().unwrap();

    let promise = manager.lock_all(&[a.clone(), b.clone()], 1, LONG);
    // owner 1 gives up on `a` while still waiting for both
    manager.unlock(&a, &1);
    assert!(promise.is_available());

    // the waiter on `b` was cancelled along with it
    manager.unlock(&b, &3);
    assert_eq!(None, manager.owner(&b));
    assert!(!manager.is_locked(&b));

    assert_eq!(
        Err(LockError::AlreadyReleased {
            key: "\"a\"".to_owned(),
            owner: "1".to_owned()
        }),
        promise.lock()
    );
    assert!(manager.owns_lock(&a, &2));
    assert_eq!(1, manager.size());
}

#[test]
fn test_retry_after_unobserved_timeout() {
    let manager = create_manager(LockManagerOptions::default());
    let key = "k".to_owned();
    manager.lock(&key, 1, LONG).lock().unwrap();

    let first = manager.lock(&key, 2, Duration::from_millis(20));
    // only the scheduled task sees the timeout
    thread::sleep(Duration::from_millis(200));

    let retry = manager.lock(&key, 2, LONG);
    assert!(retry.is_available());
    assert_eq!(
        Err(LockError::Timeout {
            key: "\"k\"".to_owned(),
            owner: "2".to_owned()
        }),
        retry.lock()
    );
    assert!(first.is_available());

    // the failure was observed, a new attempt queues again
    let again = manager.lock(&key, 2, LONG);
    assert!(!again.is_available());
    manager.unlock(&key, &1);
    again.lock().unwrap();
    assert_eq!(Some(2), manager.owner(&key));
}

#[test]
fn test_lock_all_opposite_order() {
    let manager = Arc::new(create_manager(LockManagerOptions::default()));
    let next_owner = Arc::new(AtomicU64::new(1));
    let thread_count = 8;
    let barrier = Arc::new(Barrier::new(thread_count));

    let handles: Vec<_> = (0..thread_count)
        .map(|_| {
            let manager = manager.clone();
            let next_owner = next_owner.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                barrier.wait();
                for _ in 0..200 {
                    let owner = next_owner.fetch_add(1, Ordering::SeqCst);
                    let mut keys = vec!["k1".to_owned(), "k2".to_owned()];
                    if rng.gen_bool(0.5) {
                        keys.reverse();
                    }
                    manager.lock_all(&keys, owner, LONG).lock().unwrap();
                    assert!(manager.owns_lock(&keys[0], &owner));
                    assert!(manager.owns_lock(&keys[1], &owner));
                    manager.unlock_all(&keys, &owner);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(0, manager.num_locks_held());
    assert_eq!(0, manager.size());
}

#[test]
fn test_mutual_exclusion() {
    let manager = Arc::new(create_manager(LockManagerOptions::striped(4)));
    let counter = Arc::new(Mutex::new(0u64));
    let next_owner = Arc::new(AtomicU64::new(1));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let counter = counter.clone();
            let next_owner = next_owner.clone();
            thread::spawn(move || {
                let key = "counter".to_owned();
                for _ in 0..100 {
                    let owner = next_owner.fetch_add(1, Ordering::SeqCst);
                    manager.lock(&key, owner, LONG).lock().unwrap();
                    {
                        // never contended while the lock is held
                        let mut c = counter.try_lock().unwrap();
                        *c += 1;
                    }
                    manager.unlock(&key, &owner);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(800, *counter.lock().unwrap());
}

#[test]
fn test_striped_size() {
    let manager = create_manager(LockManagerOptions::striped(8));
    assert_eq!(8, manager.size());
    let keys: Vec<String> = (0..100).map(|i| format!("key{}", i)).collect();
    // keys sharing a stripe are re-entrant for the same owner
    manager.lock_all(&keys, 1, LONG).lock().unwrap();
    assert_eq!(8, manager.size());
    assert!(manager.num_locks_held() <= 8);
    assert!(keys.iter().all(|key| manager.owns_lock(key, &1)));

    manager.unlock_all(&keys, &1);
    assert_eq!(8, manager.num_locks_available());
}
