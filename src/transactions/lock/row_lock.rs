use crate::error::LockError;
use crate::signal::CompletionSignal;
use crate::transactions::lock::{
    DeadlockChecker, LockKey, LockListener, LockOwner, LockPromise, LockState,
};
use crate::Result;
use arc_swap::ArcSwapOption;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-(lock, owner) bookkeeping: who asks, until when, and how far it got.
pub struct LockPlaceHolder<O> {
    owner: O,
    /// Arrival order on its lock.
    seq: u64,
    /// `None` never expires.
    deadline: Option<Instant>,
    state: AtomicU8,
    signal: CompletionSignal<LockState>,
}

impl<O: LockOwner> LockPlaceHolder<O> {
    fn new(owner: O, timeout: Duration, seq: u64) -> LockPlaceHolder<O> {
        LockPlaceHolder {
            owner,
            seq,
            deadline: Instant::now().checked_add(timeout),
            state: AtomicU8::new(LockState::Waiting as u8),
            signal: CompletionSignal::new(),
        }
    }

    #[inline]
    pub fn owner(&self) -> &O {
        &self.owner
    }

    #[inline]
    pub fn state(&self) -> LockState {
        LockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// `None` when the request never expires.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn cas_state(&self, expected: LockState, new: LockState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to RELEASED from WAITING or ACQUIRED, returning the state it left.
    fn transition_to_released(&self) -> Option<LockState> {
        loop {
            let state = self.state();
            match state {
                LockState::Waiting | LockState::Acquired => {
                    if self.cas_state(state, LockState::Released) {
                        return Some(state);
                    }
                }
                _ => return None,
            }
        }
    }

    /// Whoever wins a transition out of WAITING publishes it here, exactly once.
    fn notify(&self, state: LockState) {
        self.signal.complete(state);
    }
}

impl<O: fmt::Debug> fmt::Debug for LockPlaceHolder<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockPlaceHolder")
            .field("owner", &self.owner)
            .field("seq", &self.seq)
            .field("state", &LockState::from_u8(self.state.load(Ordering::Acquire)))
            .field("deadline", &self.deadline)
            .finish()
    }
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// Exclusive lock on one key (or one stripe of keys).
///
/// Holds at most one owner in `current` plus the waiting owners ordered by
/// arrival. The holder slot and the state of every request only change by
/// compare-and-swap, the queue and owner map are concurrent structures; no
/// method blocks the caller.
///
/// A request stays in the owner map after it timed out or deadlocked, so that
/// a retry by the same owner finds it, until its owner observes the outcome
/// or releases the lock.
pub struct RowLock<O> {
    current: ArcSwapOption<LockPlaceHolder<O>>,
    /// Requests not holding the lock yet, keyed by arrival order.
    pending: SkipMap<u64, Arc<LockPlaceHolder<O>>>,
    next_seq: AtomicU64,
    requests: DashMap<O, Arc<LockPlaceHolder<O>>>,
    /// Invoked after a request leaves the lock, lets a container drop empty locks.
    on_release: Option<ReleaseHook>,
}

impl<O: LockOwner> RowLock<O> {
    pub fn new() -> RowLock<O> {
        RowLock {
            current: ArcSwapOption::empty(),
            pending: SkipMap::new(),
            next_seq: AtomicU64::new(0),
            requests: DashMap::with_shard_amount(4),
            on_release: None,
        }
    }

    pub(crate) fn with_release_hook(hook: ReleaseHook) -> RowLock<O> {
        RowLock {
            on_release: Some(hook),
            ..RowLock::new()
        }
    }

    /// Request the lock for `owner`.
    ///
    /// Calling it again for an owner that already has a request returns the same
    /// request, whatever its state, until the owner observed a failure or
    /// released the lock.
    pub fn acquire(&self, owner: O, timeout: Duration) -> Arc<LockPlaceHolder<O>> {
        let (request, granted) = self.acquire_deferred(owner, timeout);
        if let Some(granted) = granted {
            granted.notify(LockState::Acquired);
        }
        request
    }

    /// Like [`RowLock::acquire`] but hands back the request granted by this call,
    /// if any, instead of notifying it. Lets a container publish the grant
    /// after leaving its own critical section.
    pub(crate) fn acquire_deferred(
        &self,
        owner: O,
        timeout: Duration,
    ) -> (Arc<LockPlaceHolder<O>>, Option<Arc<LockPlaceHolder<O>>>) {
        if let Some(request) = self.requests.get(&owner) {
            return (request.value().clone(), None);
        }

        let mut created = false;
        let request = {
            let entry = self.requests.entry(owner.clone()).or_insert_with(|| {
                created = true;
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let request = Arc::new(LockPlaceHolder::new(owner, timeout, seq));
                self.pending.insert(seq, request.clone());
                request
            });
            entry.value().clone()
        };
        if !created {
            return (request, None);
        }

        trace!("{:?} waiting for lock", request.owner);
        let granted = self.promote(None);
        (request, granted)
    }

    pub(crate) fn notify_granted(&self, granted: &Arc<LockPlaceHolder<O>>) {
        granted.notify(LockState::Acquired);
    }

    /// Release the lock, or give up waiting for it. Unknown owners are ignored.
    pub fn release(&self, owner: &O) {
        let request = match self.requests.get(owner) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        self.forget(&request);
        let previous = match request.transition_to_released() {
            Some(previous) => previous,
            None => {
                // a timed out or deadlocked request, now seen by its owner
                self.trigger_released();
                return;
            }
        };
        trace!("{:?} released lock ({:?})", request.owner, previous);
        if previous == LockState::Waiting {
            self.remove_pending(&request);
            request.notify(LockState::Released);
        }
        if let Some(granted) = self.promote(Some(request)) {
            granted.notify(LockState::Acquired);
        }
        self.trigger_released();
    }

    /// Cancel a waiting request with [`LockState::TimedOut`] or
    /// [`LockState::Deadlocked`]. A request that already left WAITING is left
    /// as is; the thread that moved it notifies its listeners.
    pub fn cancel(&self, request: &Arc<LockPlaceHolder<O>>, cause: LockState) -> Result<()> {
        if !cause.is_cancel_reason() {
            return Err(LockError::IllegalState(format!(
                "cannot cancel a lock request with {:?}",
                cause
            )));
        }
        if !request.cas_state(LockState::Waiting, cause) {
            return Ok(());
        }

        debug!("lock request of {:?} cancelled: {:?}", request.owner, cause);
        self.remove_pending(request);
        request.notify(cause);
        // it may have been installed as holder right before the cancellation
        if let Some(granted) = self.promote(Some(request.clone())) {
            granted.notify(LockState::Acquired);
        }
        self.trigger_released();
        Ok(())
    }

    /// Drop a failed request once its owner has seen the failure.
    pub(crate) fn discard(&self, request: &Arc<LockPlaceHolder<O>>) {
        if !request.state().is_terminal() {
            return;
        }
        self.forget(request);
        self.trigger_released();
    }

    /// Time out expired waiting requests, then evaluate `checker` for the
    /// remaining ones against the current holder and cancel the ones it flags
    /// with [`LockState::Deadlocked`].
    pub fn deadlock_check(&self, checker: &dyn DeadlockChecker<O>) {
        let holder = self.current.load_full();
        let waiting: Vec<Arc<LockPlaceHolder<O>>> = self
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for request in waiting {
            if request.state() != LockState::Waiting {
                continue;
            }
            if holder.as_ref().map_or(false, |h| Arc::ptr_eq(&request, h)) {
                continue;
            }
            // a timeout is cheaper to detect than a deadlock
            if request.is_expired() {
                self.cancel_quietly(&request, LockState::TimedOut);
                continue;
            }
            if let Some(holder) = &holder {
                if checker.deadlock_detected(&request.owner, &holder.owner) {
                    self.cancel_quietly(&request, LockState::Deadlocked);
                }
            }
        }
    }

    fn cancel_quietly(&self, request: &Arc<LockPlaceHolder<O>>, cause: LockState) {
        if let Err(e) = self.cancel(request, cause) {
            warn!("{}", e);
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn owner(&self) -> Option<O> {
        self.current.load_full().map(|holder| holder.owner.clone())
    }

    /// `true` if `owner` holds the lock.
    pub fn is_owner(&self, owner: &O) -> bool {
        self.current
            .load_full()
            .map_or(false, |holder| holder.owner.eq(owner))
    }

    /// `true` if `owner` holds, waits for, or has an unobserved failed request
    /// on the lock.
    pub fn contains_owner(&self, owner: &O) -> bool {
        self.requests.contains_key(owner)
    }

    /// No holder, nobody waiting and no request left to observe.
    pub fn is_empty(&self) -> bool {
        !self.is_locked() && self.pending.is_empty() && self.requests.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.pending.len()
    }

    /// Hand the holder slot to the next waiting request.
    ///
    /// `to_release` is cleared from the slot first if it is the holder. Returns
    /// the request granted by this call, which the caller must notify.
    fn promote(
        &self,
        mut to_release: Option<Arc<LockPlaceHolder<O>>>,
    ) -> Option<Arc<LockPlaceHolder<O>>> {
        loop {
            // Orders a queue insert or a slot clear made by this thread against
            // the reads below, so that a concurrent acquire and release cannot
            // both miss each other.
            fence(Ordering::SeqCst);
            let holder = self.current.load_full();
            if let Some(current) = &holder {
                let releasing = to_release
                    .as_ref()
                    .map_or(false, |r| Arc::ptr_eq(r, current));
                if !releasing {
                    return None;
                }
                if self.cas_holder(&holder, None) {
                    to_release = None;
                }
                continue;
            }

            let next = match self.pending.front() {
                Some(entry) => entry.value().clone(),
                None => return None,
            };
            if !self.cas_holder(&None, Some(next.clone())) {
                continue;
            }
            self.remove_pending(&next);
            if next.cas_state(LockState::Waiting, LockState::Acquired) {
                trace!("{:?} acquired lock", next.owner);
                return Some(next);
            }
            // released or cancelled while being installed, free the slot again
            to_release = Some(next);
        }
    }

    fn cas_holder(
        &self,
        expected: &Option<Arc<LockPlaceHolder<O>>>,
        new: Option<Arc<LockPlaceHolder<O>>>,
    ) -> bool {
        let previous = self.current.compare_and_swap(expected, new);
        same_request(&*previous, expected)
    }

    #[inline]
    fn remove_pending(&self, request: &LockPlaceHolder<O>) {
        self.pending.remove(&request.seq);
    }

    fn forget(&self, request: &Arc<LockPlaceHolder<O>>) {
        self.requests
            .remove_if(&request.owner, |_, r| Arc::ptr_eq(r, request));
    }

    fn trigger_released(&self) {
        if let Some(hook) = &self.on_release {
            hook();
        }
    }
}

impl<O: LockOwner> Default for RowLock<O> {
    fn default() -> Self {
        RowLock::new()
    }
}

impl<O: LockOwner> fmt::Debug for RowLock<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLock")
            .field("owner", &self.owner())
            .field("waiting", &self.num_waiting())
            .finish()
    }
}

fn same_request<O>(a: &Option<Arc<LockPlaceHolder<O>>>, b: &Option<Arc<LockPlaceHolder<O>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// [`LockPromise`] of one key: the lock paired with the owner's request on it.
pub struct KeyLockPromise<K, O> {
    key: K,
    lock: Arc<RowLock<O>>,
    request: Arc<LockPlaceHolder<O>>,
}

impl<K: LockKey, O: LockOwner> KeyLockPromise<K, O> {
    pub(crate) fn new(
        key: K,
        lock: Arc<RowLock<O>>,
        request: Arc<LockPlaceHolder<O>>,
    ) -> KeyLockPromise<K, O> {
        KeyLockPromise { key, lock, request }
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Owner that asked for the lock.
    #[inline]
    pub fn requestor(&self) -> &O {
        &self.request.owner
    }

    /// Owner currently holding the lock.
    pub fn lock_owner(&self) -> Option<O> {
        self.lock.owner()
    }

    #[inline]
    pub fn state(&self) -> LockState {
        self.request.state()
    }

    pub(crate) fn error_for(&self, state: LockState) -> LockError {
        let key = format!("{:?}", self.key);
        let owner = format!("{:?}", self.request.owner);
        match state {
            LockState::TimedOut => LockError::Timeout { key, owner },
            LockState::Deadlocked => LockError::Deadlock { key, owner },
            LockState::Released => LockError::AlreadyReleased { key, owner },
            s => LockError::IllegalState(format!(
                "request of {} on {} failed in state {:?}",
                owner, key, s
            )),
        }
    }

    /// Forget the request if it failed; the caller is the owner observing it.
    pub(crate) fn discard_failed(&self) {
        self.lock.discard(&self.request);
    }

    fn outcome(&self, state: LockState) -> Result<()> {
        if state == LockState::Acquired {
            return Ok(());
        }
        self.discard_failed();
        Err(self.error_for(state))
    }
}

impl<K: LockKey, O: LockOwner> LockPromise for KeyLockPromise<K, O> {
    fn is_available(&self) -> bool {
        if self.request.state() != LockState::Waiting {
            return true;
        }
        if self.request.is_expired() {
            if let Err(e) = self.lock.cancel(&self.request, LockState::TimedOut) {
                warn!("{}", e);
            }
        }
        self.request.state() != LockState::Waiting
    }

    fn lock(&self) -> Result<()> {
        loop {
            if let Some(state) = self.request.signal.get() {
                return self.outcome(state);
            }
            match self.request.remaining() {
                Some(remaining) if remaining == Duration::from_secs(0) => {
                    self.lock.cancel(&self.request, LockState::TimedOut)?;
                    // the winning transition always publishes, possibly from
                    // another thread
                    if let Some(state) = self.request.signal.wait(None) {
                        return self.outcome(state);
                    }
                }
                remaining => {
                    self.request.signal.wait(remaining);
                }
            }
        }
    }

    fn add_listener(&self, listener: LockListener) {
        self.request.signal.add_listener(listener);
    }

    fn cancel(&self, cause: LockState) -> Result<()> {
        self.lock.cancel(&self.request, cause)
    }
}

impl<K: fmt::Debug, O: fmt::Debug> fmt::Debug for KeyLockPromise<K, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockPromise")
            .field("key", &self.key)
            .field("request", &self.request)
            .finish()
    }
}
