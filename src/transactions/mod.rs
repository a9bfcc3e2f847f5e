pub mod lock;
pub mod pending;
pub mod transaction;

/// Version of the cluster's key-to-node ownership assignment, increasing.
pub type TopologyId = u32;
