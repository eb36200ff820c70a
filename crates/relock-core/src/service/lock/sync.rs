//! Local synchronizer
//!
//! One `LocalSync` exists per lock handle. It caches the ownership part of the
//! shared record, queues the threads of this node that wait for the lock, and
//! decides when a thread may try the global compare-and-set. Threads park on a
//! single condition variable and re-check their own wake-up criteria; the
//! queue head only retries after a wake pass so a held lock is not polled.
//!
//! No store call is ever made while `state` is locked: the store delivers
//! record updates on the committing thread, and the update listener needs
//! this mutex.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use parking_lot::{Condvar, Mutex};
use relock_common::{LockError, NO_THREAD, NodeId, ThreadToken};
use relock_consistency::GlobalLockState;
use tracing::{debug, error, info};

use super::condition::ConditionQueue;
use super::protocol::{CasOutcome, PublishOutcome};
use crate::model::NodeContext;

/// How a blocked acquisition reacts to interruption and time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcquireMode {
    /// Keep waiting; the interrupt flag is restored once the lock is acquired
    Uninterruptible,
    /// Give up with `LockError::Interrupted`
    Interruptible,
    /// Interruptible, and give up at the deadline
    Deadline(Instant),
}

#[derive(Default)]
pub(crate) struct SyncState {
    pub(crate) permits: u32,
    pub(crate) owner_node: Option<NodeId>,
    pub(crate) owner_thread: u64,
    /// Version of the last record copied into this cache
    pub(crate) version: u64,
    /// Threads of this node blocked in `acquire`, in arrival order
    pub(crate) queue: VecDeque<ThreadToken>,
    /// Bumped by every wake pass
    pub(crate) wake_seq: u64,
    pub(crate) conditions: HashMap<String, ConditionQueue>,
    /// Condition wait tickets that were signaled but not yet collected
    pub(crate) signaled: HashSet<u64>,
    pub(crate) next_ticket: u64,
    /// condition -> number of signals, 0 meaning all waiters
    pub(crate) outgoing_signals: HashMap<String, u32>,
    pub(crate) last_condition: Option<String>,
}

impl SyncState {
    pub(crate) fn is_held_by(&self, node: &NodeId, thread: u64) -> bool {
        self.permits != 0 && self.owner_node.as_ref() == Some(node) && self.owner_thread == thread
    }
}

pub(crate) struct LocalSync {
    pub(crate) name: String,
    pub(crate) key: String,
    pub(crate) node: NodeId,
    pub(crate) ctx: NodeContext,
    pub(crate) fair: bool,
    pub(crate) failover_safe: bool,
    pub(crate) park_interval: Duration,
    pub(crate) state: Mutex<SyncState>,
    pub(crate) changed: Condvar,
    /// Threads holding an entry in the shared fair queue
    pub(crate) waiting_threads: DashSet<u64>,
    broken: AtomicBool,
    interrupt_all: AtomicBool,
    detached: AtomicBool,
}

impl LocalSync {
    pub(crate) fn new(key: &str, ctx: NodeContext, record: &GlobalLockState) -> Self {
        let state = SyncState {
            permits: record.permits,
            owner_node: record.owner_node,
            owner_thread: record.owner_thread,
            version: record.version,
            ..Default::default()
        };

        Self {
            name: record.name.clone(),
            key: key.to_string(),
            node: ctx.node_id,
            park_interval: ctx.config.park_interval(),
            ctx,
            fair: record.fair,
            failover_safe: record.failover_safe,
            state: Mutex::new(state),
            changed: Condvar::new(),
            waiting_threads: DashSet::new(),
            broken: AtomicBool::new(false),
            interrupt_all: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub(crate) fn set_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn interrupted_all(&self) -> bool {
        self.interrupt_all.load(Ordering::SeqCst)
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Stop waiting for record updates; the record is gone
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    pub(crate) fn owner_node(&self) -> Option<NodeId> {
        self.state.lock().owner_node
    }

    pub(crate) fn is_held_exclusively(&self) -> bool {
        self.state
            .lock()
            .is_held_by(&self.node, ThreadToken::current().id())
    }

    pub(crate) fn hold_count(&self) -> u32 {
        let state = self.state.lock();
        if state.is_held_by(&self.node, ThreadToken::current().id()) {
            state.permits
        } else {
            0
        }
    }

    pub(crate) fn permits(&self) -> u32 {
        self.state.lock().permits
    }

    pub(crate) fn has_queued_threads(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    pub(crate) fn is_queued(&self, thread: &ThreadToken) -> bool {
        self.state.lock().queue.contains(thread)
    }

    pub(crate) fn interrupted_error(&self) -> LockError {
        LockError::Interrupted(self.name.clone())
    }

    /// Let the head of the local queue retry the lock
    pub(crate) fn wake_pass(&self) {
        let mut state = self.state.lock();
        state.wake_seq = state.wake_seq.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Try to take `acquires` permits without blocking on the local queue.
    ///
    /// Returns `Ok(true)` immediately once the lock is broken, so blocked
    /// callers unwind and report it. In fair mode a failed attempt registers
    /// the thread in the shared queue (once per waiting thread).
    pub(crate) fn try_acquire(&self, acquires: u32, fair: bool) -> Result<bool, LockError> {
        if self.interrupted_all() {
            return Ok(true);
        }

        let token = ThreadToken::current();
        let free = {
            let mut state = self.state.lock();
            let owner_dead = state.permits != 0
                && state
                    .owner_node
                    .is_some_and(|owner| !self.ctx.is_alive(&owner));

            if state.permits == 0 || owner_dead {
                true
            } else if state.is_held_by(&self.node, token.id()) {
                state.permits = state
                    .permits
                    .checked_add(acquires)
                    .ok_or_else(|| LockError::Overflow(self.name.clone()))?;
                return Ok(true);
            } else {
                false
            }
        };

        if free {
            match self.compare_and_set_global_state(acquires, &token, fair)? {
                CasOutcome::Acquired(version) => {
                    self.await_version(version);
                    return Ok(true);
                }
                CasOutcome::Aborted => return Ok(true),
                CasOutcome::Rejected => {}
            }
        }

        if fair && !self.waiting_threads.contains(&token.id()) {
            self.synchronize_queue(false, &token)?;
        }
        Ok(false)
    }

    /// Give back `releases` permits held by the calling thread.
    ///
    /// Returns whether the lock became free. `releases == 0` is a pure wake
    /// pass and always reports `true`.
    pub(crate) fn try_release(&self, releases: u32) -> Result<bool, LockError> {
        if releases == 0 || self.interrupted_all() {
            return Ok(true);
        }

        let thread = ThreadToken::current().id();
        let (last_condition, outgoing) = {
            let mut state = self.state.lock();
            let remaining = if state.is_held_by(&self.node, thread) {
                state.permits.checked_sub(releases)
            } else {
                None
            };

            let Some(remaining) = remaining else {
                error!(
                    lock = %self.name,
                    caller_node = %self.node,
                    owner_node = ?state.owner_node,
                    caller_thread = thread,
                    owner_thread = state.owner_thread,
                    permits = state.permits,
                    "Lock.unlock() is called in illegal state"
                );
                return Err(LockError::illegal_state(
                    &self.name,
                    "unlock called by a thread that does not own the lock",
                ));
            };

            if remaining != 0 {
                state.permits = remaining;
                return Ok(false);
            }

            (
                state.last_condition.take(),
                std::mem::take(&mut state.outgoing_signals),
            )
        };

        if let PublishOutcome::Published(version) =
            self.set_global_state(0, last_condition, outgoing)?
        {
            self.await_version(version);
        }
        Ok(true)
    }

    /// Release permits and, if the lock became free, wake the local queue
    pub(crate) fn release(&self, releases: u32) -> Result<bool, LockError> {
        let free = self.try_release(releases)?;
        if free {
            self.wake_pass();
        }
        Ok(free)
    }

    /// Block until `acquires` permits are taken, the deadline passes or the
    /// thread is interrupted (depending on `mode`).
    ///
    /// In fair mode a failed acquisition leaves the shared queue before the
    /// error is returned.
    pub(crate) fn acquire(&self, acquires: u32, mode: AcquireMode) -> Result<bool, LockError> {
        let token = ThreadToken::current();
        let mut swallowed = false;
        match mode {
            AcquireMode::Uninterruptible => swallowed = token.take_interrupt(),
            _ => {
                if token.take_interrupt() {
                    return Err(self.interrupted_error());
                }
            }
        }

        let outcome = self.acquire_queued(acquires, mode, &token, &mut swallowed);
        if outcome.is_err() && self.fair {
            // A stale entry in the shared queue would block every other node
            self.leave_queue(&token);
        }
        if swallowed {
            token.interrupt();
        }
        outcome
    }

    fn acquire_queued(
        &self,
        acquires: u32,
        mode: AcquireMode,
        token: &ThreadToken,
        swallowed: &mut bool,
    ) -> Result<bool, LockError> {
        let seen = self.state.lock().wake_seq;
        if self.try_acquire(acquires, self.fair)? {
            return Ok(true);
        }

        self.state.lock().queue.push_back(token.clone());
        let outcome = self.park_until_acquired(acquires, mode, token, swallowed, seen);

        let mut state = self.state.lock();
        state.queue.retain(|t| t != token);
        if !matches!(outcome, Ok(true)) {
            // Our successor may be the new head
            state.wake_seq = state.wake_seq.wrapping_add(1);
            self.changed.notify_all();
        }
        outcome
    }

    fn park_until_acquired(
        &self,
        acquires: u32,
        mode: AcquireMode,
        token: &ThreadToken,
        swallowed: &mut bool,
        mut seen: u64,
    ) -> Result<bool, LockError> {
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if self.interrupted_all() {
                        break;
                    }
                    if state.queue.front() == Some(token) && state.wake_seq != seen {
                        break;
                    }
                    if token.take_interrupt() {
                        if mode == AcquireMode::Uninterruptible {
                            *swallowed = true;
                            continue;
                        }
                        return Err(self.interrupted_error());
                    }

                    let wait = match mode {
                        AcquireMode::Deadline(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Ok(false);
                            }
                            (deadline - now).min(self.park_interval)
                        }
                        _ => self.park_interval,
                    };
                    self.changed.wait_for(&mut state, wait);
                }
                seen = state.wake_seq;
            }

            if self.try_acquire(acquires, self.fair)? {
                return Ok(true);
            }
        }
    }

    /// Wait until the cache reflects the record version we committed
    fn await_version(&self, version: u64) {
        let mut state = self.state.lock();
        while state.version < version && !self.interrupted_all() && !self.is_detached() {
            self.changed.wait_for(&mut state, self.park_interval);
        }
    }

    /// Check the lock is usable before and after every public operation.
    ///
    /// The interrupt flag is cleared when `throw_interrupt` is set or the lock
    /// is broken. In fair mode an interrupted caller first leaves the shared
    /// queue.
    pub(crate) fn validate(&self, throw_interrupt: bool) -> Result<(), LockError> {
        let token = ThreadToken::current();
        let interrupted = token.is_interrupted();
        let broken = self.interrupted_all();

        if throw_interrupt || broken {
            token.take_interrupt();
        }

        if broken {
            return Err(LockError::Broken(self.name.clone()));
        }

        if self.fair && throw_interrupt && interrupted {
            self.leave_queue(&token);
            return Err(self.interrupted_error());
        }
        Ok(())
    }

    /// Best-effort removal of the thread's shared queue entry
    pub(crate) fn leave_queue(&self, token: &ThreadToken) {
        if let Err(e) = self.synchronize_queue(true, token) {
            error!(lock = %self.name, error = %e, "Failed to leave fair queue");
        }
    }

    /// Break the lock for every thread of this node.
    ///
    /// Condition waiters are released, queued threads are interrupted and all
    /// further operations fail with `LockError::Broken`.
    pub(crate) fn interrupt_all(&self) {
        let mut state = self.state.lock();
        let names: Vec<String> = state.conditions.keys().cloned().collect();
        for name in names {
            state.signal_condition(&name, true);
        }

        let first = !self.interrupt_all.swap(true, Ordering::SeqCst);
        for thread in &state.queue {
            thread.interrupt();
        }
        state.wake_seq = state.wake_seq.wrapping_add(1);
        self.changed.notify_all();
        drop(state);

        if first {
            info!(lock = %self.name, node = %self.node, "Lock broken, interrupting all local operations");
            metrics::counter!("relock_lock_broken_total", "lock" => self.name.clone()).increment(1);
        }
    }

    /// Copy a committed record into the cache.
    ///
    /// With `deliver_signals`, signals addressed to this node wake local
    /// condition waiters, and the local queue gets a wake pass when the lock
    /// was freed (or signaled) by another node.
    pub(crate) fn apply(&self, record: &GlobalLockState, deliver_signals: bool) {
        let mut state = self.state.lock();
        if record.version <= state.version {
            return;
        }

        let local =
            state.owner_node == Some(self.node) || record.owner_node == Some(self.node);

        let mut signaled = false;
        if deliver_signals && let Some(conditions) = record.pending_signals.get(&self.node) {
            for condition in conditions {
                if !state.conditions.contains_key(condition) {
                    debug!(lock = %self.name, condition = %condition, "Signal for unknown condition ignored");
                    continue;
                }
                state.signal_condition(condition, false);
            }
            signaled = !conditions.is_empty();
        }

        // Reentrant holds are counted locally only; keep our count while we
        // stay the owner.
        let same_owner = record.permits != 0
            && state.permits != 0
            && state.owner_node == record.owner_node
            && state.owner_thread == record.owner_thread;
        if !same_owner {
            state.permits = record.permits;
        }
        state.owner_node = record.owner_node;
        state.owner_thread = if record.owner_node.is_some() {
            record.owner_thread
        } else {
            NO_THREAD
        };
        state.version = record.version;

        if deliver_signals && (signaled || state.permits == 0) && !local {
            state.wake_seq = state.wake_seq.wrapping_add(1);
        }
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for LocalSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalSync")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("permits", &state.permits)
            .field("owner_node", &state.owner_node)
            .field("owner_thread", &state.owner_thread)
            .field("fair", &self.fair)
            .field("failover_safe", &self.failover_safe)
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use relock_common::{LockConfig, lock_key};
    use relock_consistency::{LockStore, MemoryLockStore, RecordListener};

    use super::*;
    use crate::service::cluster::{ClusterMembership, InMemoryCluster};

    /// Feeds committed records back into the synchronizer, as a lock handle does
    struct Forward(Arc<LocalSync>);

    impl RecordListener for Forward {
        fn on_update(&self, record: &GlobalLockState) {
            if record.changed {
                self.0.apply(record, true);
            }
        }
    }

    struct Fixture {
        _cluster: InMemoryCluster,
        store: Arc<MemoryLockStore>,
        sync: Arc<LocalSync>,
        _listener: Arc<Forward>,
    }

    fn setup(fair: bool) -> Fixture {
        let cluster = InMemoryCluster::new();
        let config = LockConfig {
            park_interval_ms: 1,
            tx_retry_delay_ms: 0,
            ..Default::default()
        };
        let store = Arc::new(MemoryLockStore::new(&config));
        let node: Arc<dyn ClusterMembership> = Arc::new(cluster.join());
        let ctx = NodeContext::new(node, store.clone(), config);

        let key = lock_key("sync");
        let record = store
            .put_if_absent(&key, GlobalLockState::new("sync", fair, false))
            .unwrap();
        let sync = Arc::new(LocalSync::new(&key, ctx, &record));
        let listener = Arc::new(Forward(sync.clone()));
        store.subscribe(&key, Arc::downgrade(&listener) as Weak<dyn RecordListener>);

        Fixture {
            _cluster: cluster,
            store,
            sync,
            _listener: listener,
        }
    }

    fn owned_record(sync: &LocalSync, permits: u32, version: u64) -> GlobalLockState {
        let mut record = GlobalLockState::new("sync", sync.fair, false);
        record.permits = permits;
        record.owner_node = Some(sync.node);
        record.owner_thread = ThreadToken::current().id();
        record.version = version;
        record.changed = true;
        record
    }

    #[test]
    fn test_apply_ignores_stale_versions() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        sync.apply(&owned_record(&sync, 1, 5), true);
        assert!(sync.is_held_exclusively());

        let mut free = GlobalLockState::new("sync", false, false);
        free.version = 4;
        sync.apply(&free, true);
        assert!(sync.is_held_exclusively());
    }

    #[test]
    fn test_apply_keeps_local_reentrant_count() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        sync.apply(&owned_record(&sync, 1, 1), true);
        sync.state.lock().permits = 3;

        sync.apply(&owned_record(&sync, 1, 2), true);
        assert_eq!(sync.hold_count(), 3);
    }

    #[test]
    fn test_remote_release_wakes_queue() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        let mut held = GlobalLockState::new("sync", false, false);
        held.permits = 1;
        held.owner_node = Some(NodeId::random());
        held.owner_thread = 42;
        held.version = 1;
        sync.apply(&held, true);
        let before = sync.state.lock().wake_seq;

        let mut free = GlobalLockState::new("sync", false, false);
        free.version = 2;
        sync.apply(&free, true);
        assert_ne!(sync.state.lock().wake_seq, before);
        assert_eq!(sync.permits(), 0);
    }

    #[test]
    fn test_reentrant_acquire_is_local() {
        let Fixture { sync, store, _cluster, _listener, .. } = setup(false);
        assert!(sync.try_acquire(1, false).unwrap());
        let version = store.get(&sync.key).unwrap().unwrap().version;

        assert!(sync.try_acquire(1, false).unwrap());
        assert_eq!(sync.hold_count(), 2);
        assert_eq!(store.get(&sync.key).unwrap().unwrap().version, version);

        assert!(!sync.try_release(1).unwrap());
        assert!(sync.try_release(1).unwrap());
        assert_eq!(sync.hold_count(), 0);
        assert!(!store.get(&sync.key).unwrap().unwrap().is_locked());
    }

    #[test]
    fn test_release_without_ownership() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        let err = sync.try_release(1).unwrap_err();
        assert!(matches!(err, LockError::IllegalState { .. }));
    }

    #[test]
    fn test_overflow() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        assert!(sync.try_acquire(1, false).unwrap());
        sync.state.lock().permits = u32::MAX;
        let err = sync.try_acquire(1, false).unwrap_err();
        assert!(matches!(err, LockError::Overflow(_)));
    }

    #[test]
    fn test_deadline_acquire_times_out() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        let mut held = GlobalLockState::new("sync", false, false);
        held.permits = 1;
        held.owner_node = Some(sync.node);
        held.owner_thread = 9_999_999;
        held.version = 1;
        sync.apply(&held, false);

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!sync.acquire(1, AcquireMode::Deadline(deadline)).unwrap());
        assert!(!sync.has_queued_threads());
    }

    #[test]
    fn test_validate_after_interrupt_all() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        ThreadToken::current().interrupt();
        sync.interrupt_all();

        assert!(sync.try_acquire(1, false).unwrap());
        assert!(matches!(sync.validate(false), Err(LockError::Broken(_))));
        assert!(!ThreadToken::current().is_interrupted());
    }

    #[test]
    fn test_validate_interrupted_non_fair_clears_flag() {
        let Fixture { sync, _cluster, _listener, .. } = setup(false);
        ThreadToken::current().interrupt();
        assert!(sync.validate(true).is_ok());
        assert!(!ThreadToken::current().is_interrupted());
    }

    #[test]
    fn test_validate_interrupted_fair() {
        let Fixture { sync, _cluster, _listener, .. } = setup(true);
        ThreadToken::current().interrupt();
        assert!(matches!(sync.validate(true), Err(LockError::Interrupted(_))));
        assert!(!ThreadToken::current().is_interrupted());
    }
}
