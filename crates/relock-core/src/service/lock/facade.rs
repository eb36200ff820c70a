//! Cluster lock handle
//!
//! `ClusterLock` is the per-node handle of a named lock. It is created by the
//! [`LockManager`](super::LockManager), subscribes to the shared record and
//! builds its synchronizer lazily on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relock_common::{LockError, NodeId, ThreadToken};
use relock_consistency::{
    GlobalLockState, RecordListener, RetryPolicy, SubscriptionId, retry_topology_safe,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::condition::LockCondition;
use super::manager::ManagerInner;
use super::sync::{AcquireMode, LocalSync};
use crate::model::NodeContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Pending,
    Done,
    Failed,
}

pub(crate) struct LockInner {
    name: String,
    key: String,
    ctx: NodeContext,
    fair: bool,
    failover_safe: bool,
    sync: OnceLock<LocalSync>,
    init: Mutex<InitState>,
    /// Serializes record updates and membership events
    update_lock: Mutex<()>,
    /// Set by a stop that arrived before the synchronizer existed
    interrupt_all_pending: AtomicBool,
    removed: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    manager: Weak<ManagerInner>,
}

impl LockInner {
    fn initialize(&self) -> Result<&LocalSync, LockError> {
        let mut init = self.init.lock();
        match *init {
            InitState::Done => {
                return self
                    .sync
                    .get()
                    .ok_or_else(|| LockError::NotInitialized(self.name.clone()));
            }
            InitState::Failed => return Err(LockError::NotInitialized(self.name.clone())),
            InitState::Pending => {}
        }

        let policy = RetryPolicy::from(&self.ctx.config);
        let record = match retry_topology_safe(&policy, &self.key, || self.ctx.store.get(&self.key))
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                *init = InitState::Failed;
                debug!(lock = %self.name, "Failed to find reentrant lock with given name");
                return Err(LockError::NotFound(self.name.clone()));
            }
            Err(e) if e.is_interrupted() => {
                return Err(LockError::Interrupted(self.name.clone()));
            }
            Err(e) => {
                *init = InitState::Failed;
                return Err(LockError::transaction(&self.name, e));
            }
        };

        let _ = self.sync.set(LocalSync::new(&self.key, self.ctx.clone(), &record));
        *init = InitState::Done;
        let Some(sync) = self.sync.get() else {
            return Err(LockError::NotInitialized(self.name.clone()));
        };
        debug!(lock = %self.name, node = %self.ctx.node_id, "Initialized internal sync structure");

        // Updates committed between the read and publishing the sync were
        // dropped by the listener
        if let Ok(Some(latest)) = self.ctx.store.get(&self.key) {
            let _guard = self.update_lock.lock();
            sync.apply(&latest, false);
        }

        if self.interrupt_all_pending.load(Ordering::SeqCst) {
            sync.set_broken();
            sync.interrupt_all();
        }
        Ok(sync)
    }

    fn sync(&self) -> Result<&LocalSync, LockError> {
        match self.sync.get() {
            Some(sync) => Ok(sync),
            None => self.initialize(),
        }
    }

    pub(crate) fn on_node_removed(&self, node: &NodeId) {
        let Some(sync) = self.sync.get() else {
            return;
        };

        let _guard = self.update_lock.lock();
        if sync.owner_node().as_ref() == Some(node) {
            info!(lock = %self.name, owner = %node, failover_safe = sync.failover_safe, "Lock owner left the cluster");
            sync.set_broken();
            if !sync.failover_safe {
                sync.interrupt_all();
            }
        }
        sync.wake_pass();
    }

    pub(crate) fn on_stop(&self) {
        self.interrupt_all_pending.store(true, Ordering::SeqCst);
        if let Some(sync) = self.sync.get() {
            sync.set_broken();
            sync.interrupt_all();
            sync.wake_pass();
        }
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        if let Some(sync) = self.sync.get() {
            sync.detach();
        }
    }

    pub(crate) fn unsubscribe(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.ctx.store.unsubscribe(id);
        }
    }
}

impl RecordListener for LockInner {
    fn on_update(&self, state: &GlobalLockState) {
        // Not initialized yet; initialization reads the record itself
        let Some(sync) = self.sync.get() else {
            return;
        };

        let _guard = self.update_lock.lock();
        // Failed fair acquisitions only touch the queue
        if !state.changed {
            return;
        }
        sync.apply(state, true);
    }

    fn on_removed(&self) {
        debug!(lock = %self.name, node = %self.ctx.node_id, "Lock record removed");
        self.mark_removed();
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.ctx.store.unsubscribe(id);
        }
    }
}

/// Reentrant lock shared by every node of the cluster.
///
/// Handles are cheap to clone; clones share the same synchronizer. The
/// owning thread may acquire the lock repeatedly and must unlock it as many
/// times. Every operation fails with [`LockError::Broken`] once the lock is
/// broken on this node (owner left in non-failover-safe mode, or the local
/// node stopped).
#[derive(Clone)]
pub struct ClusterLock {
    inner: Arc<LockInner>,
}

impl ClusterLock {
    pub(crate) fn new(
        ctx: NodeContext,
        key: String,
        record: &GlobalLockState,
        manager: Weak<ManagerInner>,
    ) -> Self {
        let inner = Arc::new(LockInner {
            name: record.name.clone(),
            key,
            ctx,
            fair: record.fair,
            failover_safe: record.failover_safe,
            sync: OnceLock::new(),
            init: Mutex::new(InitState::Pending),
            update_lock: Mutex::new(()),
            interrupt_all_pending: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            subscription: Mutex::new(None),
            manager,
        });

        let listener: Weak<dyn RecordListener> = Arc::<LockInner>::downgrade(&inner);
        let id = inner.ctx.store.subscribe(&inner.key, listener);
        *inner.subscription.lock() = Some(id);

        Self { inner }
    }

    pub(crate) fn inner(&self) -> &LockInner {
        &self.inner
    }

    pub(crate) fn sync(&self) -> Result<&LocalSync, LockError> {
        self.inner.sync()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the lock was removed from the cluster
    pub fn removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub fn is_fair(&self) -> bool {
        self.inner.fair
    }

    pub fn is_failover_safe(&self) -> bool {
        self.inner.failover_safe
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// Interrupts do not abort the wait; the interrupt flag is preserved.
    pub fn lock(&self) -> Result<(), LockError> {
        let sync = self.sync()?;
        sync.acquire(1, AcquireMode::Uninterruptible)?;
        sync.validate(false)
    }

    /// Acquire the lock unless the calling thread is interrupted
    pub fn lock_interruptibly(&self) -> Result<(), LockError> {
        let sync = self.sync()?;
        let acquired = sync.acquire(1, AcquireMode::Interruptible)?;
        self.validate_after_acquire(sync, acquired)
    }

    /// Acquire the lock only if it is free right now.
    ///
    /// Barges ahead of queued nodes in fair mode.
    pub fn try_lock(&self) -> Result<bool, LockError> {
        let sync = self.sync()?;
        let acquired = sync.try_acquire(1, false)?;
        sync.validate(false)?;
        Ok(acquired)
    }

    /// Acquire the lock if it becomes available within `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, LockError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => self.lock_interruptibly().map(|_| true),
        }
    }

    /// Acquire the lock if it becomes available before `deadline`
    pub fn try_lock_until(&self, deadline: Instant) -> Result<bool, LockError> {
        let sync = self.sync()?;
        let acquired = sync.acquire(1, AcquireMode::Deadline(deadline))?;
        if !acquired && sync.fair {
            // Timed out; give up our slot in the shared queue
            sync.leave_queue(&ThreadToken::current());
        }
        self.validate_after_acquire(sync, acquired)?;
        Ok(acquired)
    }

    /// An interrupt noticed after acquiring gives the hold back
    fn validate_after_acquire(&self, sync: &LocalSync, acquired: bool) -> Result<(), LockError> {
        match sync.validate(true) {
            Err(e) if e.is_interrupted() && acquired && sync.is_held_exclusively() => {
                sync.release(1)?;
                Err(e)
            }
            other => other,
        }
    }

    /// Release one hold; the lock is freed when the hold count reaches zero
    pub fn unlock(&self) -> Result<(), LockError> {
        let sync = self.sync()?;
        sync.validate(false)?;
        sync.release(1)?;
        Ok(())
    }

    /// Condition of this lock with the given name
    pub fn get_or_create_condition(&self, name: &str) -> Result<LockCondition<'_>, LockError> {
        let sync = self.sync()?;
        sync.new_condition(name);
        sync.validate(false)?;
        Ok(LockCondition::new(self, name.to_string()))
    }

    /// Holds of the calling thread, 0 if it does not own the lock
    pub fn hold_count(&self) -> Result<u32, LockError> {
        Ok(self.sync()?.hold_count())
    }

    pub fn is_held_by_current_thread(&self) -> Result<bool, LockError> {
        Ok(self.sync()?.is_held_exclusively())
    }

    /// Whether any thread of any node holds the lock, as last seen here
    pub fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.sync()?.permits() != 0)
    }

    /// Whether threads of this node are blocked waiting for the lock
    pub fn has_queued_threads(&self) -> Result<bool, LockError> {
        Ok(self.sync()?.has_queued_threads())
    }

    pub fn has_queued_thread(&self, thread: &ThreadToken) -> Result<bool, LockError> {
        Ok(self.sync()?.is_queued(thread))
    }

    /// Whether threads of this node wait on `condition`; owner only
    pub fn has_waiters(&self, condition: &LockCondition<'_>) -> Result<bool, LockError> {
        self.sync()?.has_waiters(condition.name())
    }

    pub fn wait_queue_length(&self, condition: &LockCondition<'_>) -> Result<usize, LockError> {
        self.sync()?.wait_queue_length(condition.name())
    }

    /// Whether the lock owner left the cluster while holding the lock.
    ///
    /// In failover-safe mode the lock stays usable and this reports the
    /// takeover.
    pub fn is_broken(&self) -> Result<bool, LockError> {
        Ok(self.sync()?.is_broken())
    }

    /// Remove the lock from the cluster.
    ///
    /// A broken non-failover-safe lock is removed even if still held.
    pub fn close(&self) -> Result<(), LockError> {
        if self.removed() {
            return Ok(());
        }

        let force = self
            .inner
            .sync
            .get()
            .is_some_and(|sync| sync.is_broken() && !sync.failover_safe);
        match self.inner.manager.upgrade() {
            Some(manager) => manager.remove(&self.inner.name, force).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Serializable reference, resolved with [`LockManager::resolve`](super::LockManager::resolve)
    pub fn to_ref(&self) -> LockRef {
        LockRef {
            name: self.inner.name.clone(),
        }
    }
}

impl std::fmt::Debug for ClusterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ClusterLock");
        debug
            .field("name", &self.inner.name)
            .field("node", &self.inner.ctx.node_id)
            .field("fair", &self.inner.fair)
            .field("failover_safe", &self.inner.failover_safe)
            .field("removed", &self.removed());
        if let Some(sync) = self.inner.sync.get() {
            debug.field("sync", sync);
        }
        debug.finish()
    }
}

/// Name-only reference to a cluster lock, safe to serialize and ship to
/// another node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRef {
    name: String,
}

impl LockRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
