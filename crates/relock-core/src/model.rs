// Core data models shared by lock handles on one node

use std::sync::Arc;

use relock_common::{LockConfig, NodeId};
use relock_consistency::LockStore;

use crate::service::cluster::ClusterMembership;

/// Everything a lock handle needs to know about the node it lives on
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub store: Arc<dyn LockStore>,
    pub membership: Arc<dyn ClusterMembership>,
    pub config: LockConfig,
}

impl NodeContext {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        store: Arc<dyn LockStore>,
        config: LockConfig,
    ) -> Self {
        Self {
            node_id: membership.local_node(),
            store,
            membership,
            config,
        }
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.membership.is_alive(node)
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}
