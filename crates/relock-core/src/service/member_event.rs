// Member change event handling
// Delivers cluster membership changes to registered listeners

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use relock_common::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Type of member change event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberChangeType {
    /// A new member joined the cluster
    MemberJoin,
    /// A member left the cluster (shutdown or failure)
    MemberLeave,
}

impl std::fmt::Display for MemberChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberChangeType::MemberJoin => write!(f, "MEMBER_JOIN"),
            MemberChangeType::MemberLeave => write!(f, "MEMBER_LEAVE"),
        }
    }
}

/// Member change event
#[derive(Clone, Debug)]
pub struct MemberChangeEvent {
    /// Type of change
    pub change_type: MemberChangeType,
    /// The affected member
    pub node: NodeId,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl MemberChangeEvent {
    /// Create a new member join event
    pub fn member_join(node: NodeId) -> Self {
        Self {
            change_type: MemberChangeType::MemberJoin,
            node,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a new member leave event
    pub fn member_leave(node: NodeId) -> Self {
        Self {
            change_type: MemberChangeType::MemberLeave,
            node,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Trait for handling member change events
///
/// Events are delivered synchronously on the publishing thread.
pub trait MemberChangeListener: Send + Sync {
    /// Called when a member change event occurs
    fn on_member_change(&self, event: &MemberChangeEvent);
}

/// Member change event publisher
/// Keeps weak references to listeners and broadcasts events to the live ones
#[derive(Default)]
pub struct MemberChangeEventPublisher {
    listeners: RwLock<Vec<Weak<dyn MemberChangeListener>>>,
}

impl MemberChangeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for member change events
    pub fn register_listener(&self, listener: Weak<dyn MemberChangeListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
        debug!(
            "Registered member change listener, total: {}",
            listeners.len()
        );
    }

    /// Publish a member change event
    pub fn publish(&self, event: &MemberChangeEvent) {
        let listeners: Vec<Arc<dyn MemberChangeListener>> = self
            .listeners
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        info!(
            "Publishing member change event: {} for {}",
            event.change_type, event.node
        );

        for listener in listeners {
            listener.on_member_change(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}
