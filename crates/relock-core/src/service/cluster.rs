// Cluster membership
// Which nodes are alive, and who gets told when that changes

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use relock_common::NodeId;
use tracing::info;

use super::member_event::{MemberChangeEvent, MemberChangeEventPublisher, MemberChangeListener};

/// Membership view of one node
pub trait ClusterMembership: Send + Sync {
    /// Id of the node this view belongs to
    fn local_node(&self) -> NodeId;

    fn is_alive(&self, node: &NodeId) -> bool;

    fn alive_nodes(&self) -> Vec<NodeId>;

    /// Receive membership events observed by this node
    fn register_listener(&self, listener: Weak<dyn MemberChangeListener>);
}

struct ClusterShared {
    /// node id -> join timestamp (Unix millis)
    members: DashMap<NodeId, i64>,
    publishers: DashMap<NodeId, Arc<MemberChangeEventPublisher>>,
}

impl ClusterShared {
    /// Publish to every member's publisher except the affected node
    fn broadcast(&self, event: &MemberChangeEvent) {
        let publishers: Vec<Arc<MemberChangeEventPublisher>> = self
            .publishers
            .iter()
            .filter(|entry| *entry.key() != event.node)
            .map(|entry| entry.value().clone())
            .collect();

        for publisher in publishers {
            publisher.publish(event);
        }
    }
}

/// Single-process cluster for embedding and tests
#[derive(Clone)]
pub struct InMemoryCluster {
    shared: Arc<ClusterShared>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClusterShared {
                members: DashMap::new(),
                publishers: DashMap::new(),
            }),
        }
    }

    /// Add a new node and return its membership view
    pub fn join(&self) -> ClusterNode {
        let id = NodeId::random();
        self.shared
            .members
            .insert(id, chrono::Utc::now().timestamp_millis());
        self.shared
            .publishers
            .insert(id, Arc::new(MemberChangeEventPublisher::new()));

        info!(node = %id, "Node joined cluster");
        self.shared.broadcast(&MemberChangeEvent::member_join(id));

        ClusterNode {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Remove a node, as if it crashed or shut down; returns whether it was a member
    pub fn leave(&self, node: &NodeId) -> bool {
        if self.shared.members.remove(node).is_none() {
            return false;
        }
        self.shared.publishers.remove(node);

        info!(node = %node, "Node left cluster");
        self.shared.broadcast(&MemberChangeEvent::member_leave(*node));
        true
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.shared.members.iter().map(|e| *e.key()).collect()
    }
}

/// Membership view of one node of an [`InMemoryCluster`]
#[derive(Clone)]
pub struct ClusterNode {
    id: NodeId,
    shared: Arc<ClusterShared>,
}

impl ClusterNode {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl ClusterMembership for ClusterNode {
    fn local_node(&self) -> NodeId {
        self.id
    }

    fn is_alive(&self, node: &NodeId) -> bool {
        self.shared.members.contains_key(node)
    }

    fn alive_nodes(&self) -> Vec<NodeId> {
        self.shared.members.iter().map(|e| *e.key()).collect()
    }

    fn register_listener(&self, listener: Weak<dyn MemberChangeListener>) {
        if let Some(publisher) = self.shared.publishers.get(&self.id) {
            publisher.register_listener(listener);
        }
    }
}
