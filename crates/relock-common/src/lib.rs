//! Relock Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all relock components:
//! - Error types and error kinds
//! - Node and thread identity
//! - Lock configuration

pub mod config;
pub mod error;
pub mod node;
pub mod thread;

// Re-exports for convenience
pub use config::LockConfig;
pub use error::{ErrorKind, LockError, StoreError};
pub use node::NodeId;
pub use thread::{NO_THREAD, ThreadToken, current_thread_id};

/// Prefix of the store key under which a reentrant lock record is kept
pub const LOCK_KEY_PREFIX: &str = "reentrant-lock::";

/// Store key of the reentrant lock with the given name
pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}
