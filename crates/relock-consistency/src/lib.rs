//! Relock Consistency - shared lock state and the store it lives in
//!
//! This crate provides:
//! - The shared lock record replicated to every node (`GlobalLockState`)
//! - The transactional store contract (`LockStore`, `RecordListener`)
//! - Topology-safe transaction retries
//! - An in-memory store for embedding and tests (`MemoryLockStore`)

pub mod lock;

// Re-export lock types
pub use lock::{
    AcquireRequest, GlobalLockState, LockStore, MemoryLockStore, RecordListener, ReleaseRequest,
    RetryPolicy, StoreStats, SubscriptionId, TxAction, TxBody, retry_topology_safe,
};
