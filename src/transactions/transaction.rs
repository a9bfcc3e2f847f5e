//! Views of the transaction table consumed by the pending-lock barrier.
//!
//! The table itself lives above this crate; implementors adapt their own
//! transaction records to these traits.

use crate::signal::CompletionSignal;
use crate::transactions::TopologyId;
use std::fmt::Debug;
use std::sync::Arc;

/// Fired once a transaction released its lock, or backup lock, on one key.
pub type ReleaseSignal = Arc<CompletionSignal<()>>;

pub trait PendingTransaction<K>: Send + Sync {
    type Id: Eq + Debug;

    fn id(&self) -> &Self::Id;

    /// Topology the transaction started in.
    fn topology_id(&self) -> TopologyId;

    /// `None` if the transaction holds no lock or backup lock on `key`.
    fn release_signal(&self, key: &K) -> Option<ReleaseSignal>;

    /// Transactions installed by state transfer never wait for older ones.
    fn is_from_state_transfer(&self) -> bool {
        false
    }
}

pub trait TransactionTable<K>: Send + Sync {
    type Transaction: PendingTransaction<K>;

    fn local_transactions(&self) -> Vec<Arc<Self::Transaction>>;

    fn remote_transactions(&self) -> Vec<Arc<Self::Transaction>>;

    /// Oldest topology among in-flight transactions, `None` when there are none.
    fn min_topology_id(&self) -> Option<TopologyId>;
}

pub trait TopologyProvider: Send + Sync {
    /// `None` while the cache has no topology installed.
    fn current_topology_id(&self) -> Option<TopologyId>;
}
