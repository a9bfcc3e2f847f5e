use crate::error::LockError;
use crate::signal::CompletionSignal;
use crate::transactions::lock::row_lock::KeyLockPromise;
use crate::transactions::lock::{LockKey, LockListener, LockOwner, LockPromise, LockState};
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// `Err` carries the index of the member that failed first and its state.
type Outcome = std::result::Result<(), (usize, LockState)>;

/// Promise over the locks of several keys for one owner.
///
/// Ready once every member is acquired. The first member to fail completes the
/// composite with its failure and every other waiting member is cancelled with
/// the same cause, or with [`LockState::TimedOut`] when the failed member was
/// released.
///
/// # NOTICE:
///
/// Members acquired before the failure stay acquired. Releasing them is up to
/// the caller, typically with `LockManager::unlock_all` over the same keys.
pub struct CompositeLockPromise<K, O> {
    members: Vec<Arc<KeyLockPromise<K, O>>>,
    remaining: AtomicUsize,
    deadline: Option<Instant>,
    outcome: CompletionSignal<Outcome>,
}

impl<K: LockKey, O: LockOwner> CompositeLockPromise<K, O> {
    pub(crate) fn new(
        members: Vec<Arc<KeyLockPromise<K, O>>>,
        timeout: Duration,
    ) -> Arc<CompositeLockPromise<K, O>> {
        let composite = Arc::new(CompositeLockPromise {
            remaining: AtomicUsize::new(members.len()),
            members,
            deadline: Instant::now().checked_add(timeout),
            outcome: CompletionSignal::new(),
        });
        if composite.members.is_empty() {
            composite.outcome.complete(Ok(()));
        }
        for (index, member) in composite.members.iter().enumerate() {
            let weak: Weak<CompositeLockPromise<K, O>> = Arc::downgrade(&composite);
            member.add_listener(Box::new(move |state| {
                if let Some(composite) = weak.upgrade() {
                    composite.on_member_event(index, state);
                }
            }));
        }
        composite
    }

    fn on_member_event(&self, index: usize, state: LockState) {
        if state == LockState::Acquired {
            if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.outcome.complete(Ok(()));
            }
            return;
        }
        if !self.outcome.complete(Err((index, state))) {
            return;
        }
        debug!(
            "lock on {:?} for {:?} failed with {:?}, cancelling the other {} keys",
            self.members[index].key(),
            self.members[index].requestor(),
            state,
            self.members.len() - 1
        );
        // RELEASED is not a cancel cause
        let cause = if state.is_cancel_reason() {
            state
        } else {
            LockState::TimedOut
        };
        self.cancel_members(cause, Some(index));
    }

    fn cancel_members(&self, cause: LockState, skip: Option<usize>) {
        for (i, member) in self.members.iter().enumerate() {
            if Some(i) == skip {
                continue;
            }
            if let Err(e) = member.cancel(cause) {
                warn!("{}", e);
            }
        }
    }

    pub fn members(&self) -> &[Arc<KeyLockPromise<K, O>>] {
        &self.members
    }

    /// Time left until the deadline of the whole acquisition.
    pub fn remaining_timeout(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(u64::MAX),
        }
    }

    fn result(&self, outcome: Outcome) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err((index, state)) => {
                for member in &self.members {
                    member.discard_failed();
                }
                Err(self.members[index].error_for(state))
            }
        }
    }
}

fn outcome_state(outcome: &Outcome) -> LockState {
    match outcome {
        Ok(()) => LockState::Acquired,
        Err((_, state)) => *state,
    }
}

impl<K: LockKey, O: LockOwner> LockPromise for CompositeLockPromise<K, O> {
    fn is_available(&self) -> bool {
        if self.outcome.is_complete() {
            return true;
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            self.cancel_members(LockState::TimedOut, None);
        } else {
            // lets every member check its own deadline
            for member in &self.members {
                member.is_available();
            }
        }
        self.outcome.is_complete()
    }

    fn lock(&self) -> Result<()> {
        let remaining = self.deadline.map(|_| self.remaining_timeout());
        if let Some(outcome) = self.outcome.wait(remaining) {
            return self.result(outcome);
        }
        self.cancel(LockState::TimedOut)?;
        // every member left WAITING, so the outcome is being published
        match self.outcome.wait(None) {
            Some(outcome) => self.result(outcome),
            None => Err(LockError::IllegalState(
                "composite lock promise never completed".to_owned(),
            )),
        }
    }

    fn add_listener(&self, listener: LockListener) {
        self.outcome
            .add_listener(move |outcome| listener(outcome_state(&outcome)));
    }

    fn cancel(&self, cause: LockState) -> Result<()> {
        if !cause.is_cancel_reason() {
            return Err(LockError::IllegalState(format!(
                "cannot cancel a lock request with {:?}",
                cause
            )));
        }
        self.cancel_members(cause, None);
        Ok(())
    }
}
