// Lock lifecycle management
// Creates, looks up and removes the cluster locks of one node, and forwards
// membership changes and node shutdown to every live handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use relock_common::{LockError, NodeId, lock_key};
use relock_consistency::{GlobalLockState, TxAction};
use tracing::{debug, info, warn};

use super::facade::{ClusterLock, LockRef};
use crate::model::NodeContext;
use crate::service::member_event::{MemberChangeEvent, MemberChangeListener, MemberChangeType};

pub(crate) struct ManagerInner {
    ctx: NodeContext,
    locks: DashMap<String, ClusterLock>,
    stopped: AtomicBool,
}

impl ManagerInner {
    fn handles(&self) -> Vec<ClusterLock> {
        self.locks.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Delete the shared record and drop the local handle.
    ///
    /// Refuses a lock that is still held unless `force` is set. Returns
    /// whether a record existed.
    pub(crate) fn remove(&self, name: &str, force: bool) -> Result<bool, LockError> {
        let key = lock_key(name);
        let mut held = false;

        let existed = self
            .ctx
            .store
            .transaction(&key, &mut |current| {
                let Some(state) = current else {
                    return Ok(TxAction::Rollback);
                };
                held = state.is_locked() && !force;
                if held {
                    Ok(TxAction::Rollback)
                } else {
                    Ok(TxAction::Delete)
                }
            })
            .map_err(|e| LockError::transaction(name, e))?;

        if held {
            warn!(lock = %name, "Failed to remove reentrant lock, lock is still held");
            return Err(LockError::illegal_state(
                name,
                "lock is still held; remove with force to break it",
            ));
        }

        if let Some((_, handle)) = self.locks.remove(name) {
            handle.inner().unsubscribe();
            handle.inner().mark_removed();
        }

        info!(lock = %name, node = %self.ctx.node_id, existed, force, "Removed reentrant lock");
        Ok(existed)
    }
}

impl MemberChangeListener for ManagerInner {
    fn on_member_change(&self, event: &MemberChangeEvent) {
        if event.change_type != MemberChangeType::MemberLeave {
            return;
        }

        debug!(node = %self.ctx.node_id, departed = %event.node, "Notifying locks of departed node");
        for handle in self.handles() {
            handle.inner().on_node_removed(&event.node);
        }
    }
}

/// Per-node registry of cluster locks.
///
/// One manager exists per node. It hands out [`ClusterLock`] handles (one per
/// lock name), keeps them informed of nodes leaving the cluster and breaks
/// all of them when the node stops.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl LockManager {
    pub fn new(ctx: NodeContext) -> Self {
        let inner = Arc::new(ManagerInner {
            ctx,
            locks: DashMap::new(),
            stopped: AtomicBool::new(false),
        });

        let listener: Weak<dyn MemberChangeListener> = Arc::<ManagerInner>::downgrade(&inner);
        inner.ctx.membership.register_listener(listener);

        Self { inner }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.ctx.node_id
    }

    pub fn context(&self) -> &NodeContext {
        &self.inner.ctx
    }

    /// Get the handle of lock `name`, creating the lock if `create` is set.
    ///
    /// `fair` and `failover_safe` only apply when the lock is created; an
    /// existing lock keeps its own settings. Returns `None` if the lock does
    /// not exist and `create` is not set.
    pub fn reentrant_lock(
        &self,
        name: &str,
        fair: bool,
        failover_safe: bool,
        create: bool,
    ) -> Result<Option<ClusterLock>, LockError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(LockError::illegal_state(name, "lock manager is stopped"));
        }

        if let Some(handle) = self.lookup(name) {
            return Ok(Some(handle));
        }

        let key = lock_key(name);
        let store = &self.inner.ctx.store;
        let record = if create {
            Some(
                store
                    .put_if_absent(&key, GlobalLockState::new(name, fair, failover_safe))
                    .map_err(|e| LockError::transaction(name, e))?,
            )
        } else {
            store.get(&key).map_err(|e| LockError::transaction(name, e))?
        };

        let Some(record) = record else {
            debug!(lock = %name, "Reentrant lock not found");
            return Ok(None);
        };

        let created = ClusterLock::new(
            self.inner.ctx.clone(),
            key,
            &record,
            Arc::downgrade(&self.inner),
        );
        let handle = self
            .inner
            .locks
            .entry(name.to_string())
            .and_modify(|existing| {
                if existing.removed() {
                    *existing = created.clone();
                }
            })
            .or_insert_with(|| created.clone())
            .clone();

        debug!(lock = %name, node = %self.inner.ctx.node_id, fair = handle.is_fair(), failover_safe = handle.is_failover_safe(), "Reentrant lock handle ready");
        Ok(Some(handle))
    }

    /// Handle of lock `name` if this node already has a live one
    pub fn lookup(&self, name: &str) -> Option<ClusterLock> {
        self.inner
            .locks
            .get(name)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.removed())
    }

    /// Turn a reference received from another node into a local handle
    pub fn resolve(&self, lock_ref: &LockRef) -> Result<ClusterLock, LockError> {
        self.reentrant_lock(lock_ref.name(), false, false, false)?
            .ok_or_else(|| LockError::NotFound(lock_ref.name().to_string()))
    }

    /// Remove lock `name` from the cluster; see [`ClusterLock::close`]
    pub fn remove(&self, name: &str, force: bool) -> Result<bool, LockError> {
        self.inner.remove(name, force)
    }

    /// Break every lock of this node, as on node shutdown
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(node = %self.inner.ctx.node_id, locks = self.inner.locks.len(), "Stopping lock manager");
        for handle in self.inner.handles() {
            handle.inner().on_stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("node", &self.inner.ctx.node_id)
            .field("locks", &self.inner.locks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
