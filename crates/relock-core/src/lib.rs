//! Relock Core - Cluster-wide reentrant locks
//!
//! This crate provides:
//! - `ClusterLock`, a reentrant lock shared by every node of a cluster
//! - Named conditions with cross-node signaling
//! - Per-node lock lifecycle management (`LockManager`)
//! - Cluster membership contract and an in-memory cluster

pub mod model;
pub mod service;

// Re-export cluster module
pub mod cluster {
    pub use crate::service::cluster::{ClusterMembership, ClusterNode, InMemoryCluster};
    pub use crate::service::member_event::{
        MemberChangeEvent, MemberChangeEventPublisher, MemberChangeListener, MemberChangeType,
    };
}

// Re-export commonly used types
pub use model::NodeContext;
pub use service::lock::{ClusterLock, LockCondition, LockManager, LockRef};

pub use relock_common::{ErrorKind, LockConfig, LockError, NodeId, ThreadToken};
