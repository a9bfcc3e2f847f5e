use crate::error::LockError;
use crate::scheduler::{ScheduledTask, TimeoutScheduler};
use crate::signal::CompletionSignal;
use crate::transactions::lock::LockKey;
use crate::transactions::pending::{
    PendingLockListener, PendingLockManager, PendingLockPromise, ReadyPendingLockPromise,
};
use crate::transactions::transaction::{
    PendingTransaction, ReleaseSignal, TopologyProvider, TransactionTable,
};
use crate::transactions::TopologyId;
use crate::Result;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Checks the transaction table for transactions started in an older topology
/// that still hold a lock, or backup lock, on the requested keys.
pub struct DefaultPendingLockManager<K, T, P> {
    transaction_table: Arc<T>,
    topology: Arc<P>,
    scheduler: Arc<dyn TimeoutScheduler>,
    _key: PhantomData<fn(&K)>,
}

impl<K, T, P> DefaultPendingLockManager<K, T, P>
where
    K: LockKey,
    T: TransactionTable<K>,
    P: TopologyProvider,
{
    pub fn new(
        transaction_table: Arc<T>,
        topology: Arc<P>,
        scheduler: Arc<dyn TimeoutScheduler>,
    ) -> DefaultPendingLockManager<K, T, P> {
        DefaultPendingLockManager {
            transaction_table,
            topology,
            scheduler,
            _key: PhantomData,
        }
    }

    /// Topology whose older transactions `requester` must wait for, `None` when
    /// no check is needed.
    fn pending_check_topology(&self, requester: &T::Transaction) -> Option<TopologyId> {
        // state transfer must not wait for the backup locks of other transactions
        if requester.is_from_state_transfer() {
            return None;
        }
        let current = self.topology.current_topology_id()?;
        let min = self.transaction_table.min_topology_id()?;
        if min < current {
            Some(current)
        } else {
            None
        }
    }

    fn collect_blockers(
        &self,
        requester: &T::Transaction,
        keys: &[K],
        topology_id: TopologyId,
    ) -> Vec<Blocker<K, T::Transaction>> {
        let mut transactions = self.transaction_table.local_transactions();
        transactions.extend(self.transaction_table.remote_transactions());

        let mut blockers = Vec::new();
        for transaction in transactions {
            if transaction.topology_id() >= topology_id || transaction.id() == requester.id() {
                continue;
            }
            let keys: Vec<(K, ReleaseSignal)> = keys
                .iter()
                .filter_map(|key| {
                    transaction
                        .release_signal(key)
                        .filter(|signal| !signal.is_complete())
                        .map(|signal| (key.clone(), signal))
                })
                .collect();
            if !keys.is_empty() {
                blockers.push(Blocker { transaction, keys });
            }
        }
        blockers
    }
}

impl<K, T, P> PendingLockManager<K, T::Transaction> for DefaultPendingLockManager<K, T, P>
where
    K: LockKey,
    T: TransactionTable<K> + 'static,
    T::Transaction: 'static,
    P: TopologyProvider + 'static,
{
    fn check_pending_transactions_for_keys(
        &self,
        requester: &T::Transaction,
        keys: &[K],
        timeout: Duration,
    ) -> Arc<dyn PendingLockPromise> {
        let topology_id = match self.pending_check_topology(requester) {
            Some(topology_id) => topology_id,
            None => return Arc::new(ReadyPendingLockPromise::new(timeout)),
        };
        let blockers = self.collect_blockers(requester, keys, topology_id);
        if blockers.is_empty() {
            return Arc::new(ReadyPendingLockPromise::new(timeout));
        }
        debug!(
            "transaction {:?} waits for {} transactions older than topology {}",
            requester.id(),
            blockers.len(),
            topology_id
        );
        PendingLockWait::start(
            format!("{:?}", requester.id()),
            blockers,
            timeout,
            self.scheduler.as_ref(),
        )
    }
}

struct Blocker<K, Tx> {
    transaction: Arc<Tx>,
    keys: Vec<(K, ReleaseSignal)>,
}

#[derive(Clone, Debug)]
enum PendingOutcome {
    Ready,
    TimedOut { key: String, blocker: String },
}

/// Wait on the release signals of every blocking transaction.
///
/// Each firing signal triggers a re-scan, since a transaction may release keys
/// one at a time. The timeout task re-scans once more before giving up.
pub struct PendingLockWait<K, Tx> {
    requester: String,
    blockers: Vec<Blocker<K, Tx>>,
    deadline: Option<Instant>,
    outcome: CompletionSignal<PendingOutcome>,
    timeout_task: Mutex<Option<ScheduledTask>>,
}

impl<K, Tx> PendingLockWait<K, Tx>
where
    K: LockKey,
    Tx: PendingTransaction<K> + 'static,
{
    fn start(
        requester: String,
        blockers: Vec<Blocker<K, Tx>>,
        timeout: Duration,
        scheduler: &dyn TimeoutScheduler,
    ) -> Arc<PendingLockWait<K, Tx>> {
        let wait = Arc::new(PendingLockWait {
            requester,
            blockers,
            deadline: Instant::now().checked_add(timeout),
            outcome: CompletionSignal::new(),
            timeout_task: Mutex::new(None),
        });

        for blocker in &wait.blockers {
            for (_, signal) in &blocker.keys {
                let weak = Arc::downgrade(&wait);
                signal.add_listener(move |()| {
                    if let Some(wait) = weak.upgrade() {
                        wait.on_release();
                    }
                });
            }
        }

        let target = wait.clone();
        let task = scheduler.schedule(timeout, Box::new(move || target.on_timeout()));
        *wait.timeout_task.lock().unwrap() = Some(task.clone());
        // completed before the task handle was stored
        if wait.outcome.is_complete() {
            task.cancel();
        }
        wait
    }

    fn first_unreleased(&self) -> Option<(&Tx, &K)> {
        for blocker in &self.blockers {
            for (key, signal) in &blocker.keys {
                if !signal.is_complete() {
                    return Some((blocker.transaction.as_ref(), key));
                }
            }
        }
        None
    }

    fn on_release(&self) {
        if self.first_unreleased().is_some() {
            return;
        }
        if self.outcome.complete(PendingOutcome::Ready) {
            trace!("pending locks of {} released", self.requester);
            if let Some(task) = self.timeout_task.lock().unwrap().as_ref() {
                task.cancel();
            }
        }
    }

    fn on_timeout(&self) {
        let outcome = match self.first_unreleased() {
            // the last one released right before the timeout
            None => PendingOutcome::Ready,
            Some((transaction, key)) => {
                debug!(
                    "transaction {} timed out waiting for {:?} to release {:?}",
                    self.requester,
                    transaction.id(),
                    key
                );
                PendingOutcome::TimedOut {
                    key: format!("{:?}", key),
                    blocker: format!("{:?}", transaction.id()),
                }
            }
        };
        self.outcome.complete(outcome);
    }

    fn result(&self, outcome: PendingOutcome) -> Result<Duration> {
        match outcome {
            PendingOutcome::Ready => Ok(self.remaining_timeout()),
            PendingOutcome::TimedOut { key, blocker } => Err(LockError::PendingLockTimeout {
                key,
                requester: self.requester.clone(),
                blocker,
            }),
        }
    }
}

impl<K, Tx> PendingLockPromise for PendingLockWait<K, Tx>
where
    K: LockKey,
    Tx: PendingTransaction<K> + 'static,
{
    fn is_ready(&self) -> bool {
        if self.outcome.is_complete() {
            return true;
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            self.on_timeout();
        }
        self.outcome.is_complete()
    }

    fn add_listener(&self, listener: PendingLockListener) {
        self.outcome.add_listener(move |_| listener());
    }

    fn has_timed_out(&self) -> bool {
        matches!(self.outcome.get(), Some(PendingOutcome::TimedOut { .. }))
    }

    fn remaining_timeout(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(u64::MAX),
        }
    }

    fn await_pending(&self) -> Result<Duration> {
        let remaining = self.deadline.map(|_| self.remaining_timeout());
        if let Some(outcome) = self.outcome.wait(remaining) {
            return self.result(outcome);
        }
        self.on_timeout();
        match self.outcome.get() {
            Some(outcome) => self.result(outcome),
            None => Err(LockError::IllegalState(
                "pending lock wait never completed".to_owned(),
            )),
        }
    }
}
