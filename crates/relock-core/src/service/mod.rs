// Core services for cluster membership and distributed locking

pub mod cluster;
pub mod lock;
pub mod member_event;

// Re-export commonly used types
pub use cluster::{ClusterMembership, InMemoryCluster};
pub use lock::{ClusterLock, LockManager};
