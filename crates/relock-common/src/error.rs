//! Error types for relock
//!
//! This module defines:
//! - `LockError`: errors surfaced by lock handles and conditions
//! - `StoreError`: errors raised by the shared transactional store
//! - `ErrorKind`: coarse classification callers match on

use std::fmt::{Display, Formatter};

/// Errors raised by the shared lock record store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Cluster topology changed while the transaction was running.
    #[error("topology changed during transaction on '{0}'")]
    TopologyChanged(String),

    /// The calling thread was interrupted while the transaction was pending.
    #[error("thread interrupted during transaction on '{0}'")]
    Interrupted(String),

    /// The store is shutting down or otherwise refuses work.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction on '{key}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether the store may transparently retry the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TopologyChanged(_))
    }

    /// Whether the failure was caused by interruption of the calling thread.
    pub fn is_interrupted(&self) -> bool {
        match self {
            StoreError::Interrupted(_) => true,
            StoreError::RetriesExhausted { last, .. } => last.is_interrupted(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Errors surfaced by lock operations.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lock '{lock}' is not held by the current thread: {reason}")]
    IllegalState { lock: String, reason: String },

    #[error("maximum lock count exceeded for lock '{0}'")]
    Overflow(String),

    #[error("lock '{0}' is interrupted")]
    Interrupted(String),

    #[error(
        "lock '{0}' broken (possible reason: node stopped or node owning lock failed while in non-failoversafe mode)"
    )]
    Broken(String),

    #[error("failed to find reentrant lock with given name: {0}")]
    NotFound(String),

    #[error("internal reentrant lock '{0}' has not been properly initialized")]
    NotInitialized(String),

    #[error("fair queue of lock '{lock}' is corrupted: {reason}")]
    QueueViolation { lock: String, reason: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transaction failed on lock '{lock}': {source}")]
    Transaction {
        lock: String,
        #[source]
        source: StoreError,
    },
}

/// Classification of a [`LockError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IllegalState,
    Overflow,
    Interrupted,
    Broken,
    NotFound,
    Transaction,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::IllegalState => "ILLEGAL_STATE",
            ErrorKind::Overflow => "OVERFLOW",
            ErrorKind::Interrupted => "INTERRUPTED",
            ErrorKind::Broken => "BROKEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Transaction => "TRANSACTION",
            ErrorKind::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::IllegalState { .. } => ErrorKind::IllegalState,
            LockError::Overflow(_) => ErrorKind::Overflow,
            LockError::Interrupted(_) => ErrorKind::Interrupted,
            LockError::Broken(_) => ErrorKind::Broken,
            LockError::NotFound(_) | LockError::NotInitialized(_) => ErrorKind::NotFound,
            LockError::Transaction { .. } => ErrorKind::Transaction,
            LockError::QueueViolation { .. }
            | LockError::IllegalArgument(_)
            | LockError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn illegal_state(lock: impl Into<String>, reason: impl Into<String>) -> Self {
        LockError::IllegalState {
            lock: lock.into(),
            reason: reason.into(),
        }
    }

    pub fn transaction(lock: impl Into<String>, source: StoreError) -> Self {
        LockError::Transaction {
            lock: lock.into(),
            source,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.kind() == ErrorKind::Broken
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}
