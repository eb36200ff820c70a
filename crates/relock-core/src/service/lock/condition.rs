//! Named conditions
//!
//! A condition wait fully releases the lock (publishing this node as a waiter
//! in the shared record), parks until signaled, then reacquires the lock with
//! the saved hold count. Signals are not sent directly: `signal` and
//! `signal_all` only record intent, and the next release by this node carries
//! them to the waiting nodes through the shared record.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use relock_common::{LockError, ThreadToken};

use super::facade::ClusterLock;
use super::sync::{AcquireMode, LocalSync, SyncState};

/// Local waiters of one condition, as wait tickets in arrival order
#[derive(Debug, Default)]
pub(crate) struct ConditionQueue {
    waiters: VecDeque<u64>,
}

impl SyncState {
    /// Wake the oldest waiter of `name` (or all of them) without any
    /// ownership check. Returns whether a waiter was woken.
    pub(crate) fn signal_condition(&mut self, name: &str, all: bool) -> bool {
        let Some(queue) = self.conditions.get_mut(name) else {
            return false;
        };

        if all {
            let woken = !queue.waiters.is_empty();
            self.signaled.extend(queue.waiters.drain(..));
            woken
        } else if let Some(ticket) = queue.waiters.pop_front() {
            self.signaled.insert(ticket);
            true
        } else {
            false
        }
    }

    fn cancel_wait(&mut self, name: &str, ticket: u64) {
        if let Some(queue) = self.conditions.get_mut(name) {
            queue.waiters.retain(|t| *t != ticket);
        }
        self.signaled.remove(&ticket);
    }
}

impl LocalSync {
    pub(crate) fn new_condition(&self, name: &str) {
        self.state
            .lock()
            .conditions
            .entry(name.to_string())
            .or_default();
    }

    fn not_owner(&self, operation: &str) -> LockError {
        LockError::illegal_state(
            &self.name,
            format!("{} requires the calling thread to hold the lock", operation),
        )
    }

    /// Record a signal to be delivered by this node's next release
    pub(crate) fn signal(&self, name: &str, all: bool) -> Result<(), LockError> {
        if !self.is_held_exclusively() {
            return Err(self.not_owner("signal"));
        }
        self.validate(false)?;

        let mut state = self.state.lock();
        if all {
            state.outgoing_signals.insert(name.to_string(), 0);
        } else {
            // 0 means "everyone" and absorbs further single signals
            state
                .outgoing_signals
                .entry(name.to_string())
                .and_modify(|count| {
                    if *count != 0 {
                        *count = count.saturating_add(1);
                    }
                })
                .or_insert(1);
        }
        Ok(())
    }

    /// Wait on condition `name`.
    ///
    /// Returns `Ok(false)` if the deadline passed before a signal arrived. On
    /// return (including `Interrupted`) the lock is held again with the
    /// original hold count.
    pub(crate) fn await_condition(&self, name: &str, mode: AcquireMode) -> Result<bool, LockError> {
        let token = ThreadToken::current();
        let (ticket, saved) = {
            let mut state = self.state.lock();
            if !state.is_held_by(&self.node, token.id()) {
                return Err(self.not_owner("await"));
            }
            if mode != AcquireMode::Uninterruptible && token.take_interrupt() {
                return Err(self.interrupted_error());
            }

            state.last_condition = Some(name.to_string());
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state
                .conditions
                .entry(name.to_string())
                .or_default()
                .waiters
                .push_back(ticket);
            (ticket, state.permits)
        };

        if let Err(e) = self.release(saved) {
            let mut state = self.state.lock();
            state.cancel_wait(name, ticket);
            state.last_condition = None;
            return Err(e);
        }

        let mut swallowed = false;
        let (signaled, interrupted) =
            self.park_on_condition(name, ticket, mode, &token, &mut swallowed);

        let reacquired = self.acquire(saved, AcquireMode::Uninterruptible);
        if swallowed {
            token.interrupt();
        }
        reacquired?;

        if interrupted && !self.interrupted_all() {
            return Err(self.interrupted_error());
        }
        Ok(signaled)
    }

    /// Returns `(signaled, interrupted)`
    fn park_on_condition(
        &self,
        name: &str,
        ticket: u64,
        mode: AcquireMode,
        token: &ThreadToken,
        swallowed: &mut bool,
    ) -> (bool, bool) {
        let mut state = self.state.lock();
        loop {
            if state.signaled.remove(&ticket) {
                return (true, false);
            }
            if self.interrupted_all() {
                state.cancel_wait(name, ticket);
                return (true, false);
            }
            if token.take_interrupt() {
                if mode == AcquireMode::Uninterruptible {
                    *swallowed = true;
                    continue;
                }
                state.cancel_wait(name, ticket);
                return (false, true);
            }

            let wait = match mode {
                AcquireMode::Deadline(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.cancel_wait(name, ticket);
                        return (false, false);
                    }
                    (deadline - now).min(self.park_interval)
                }
                _ => self.park_interval,
            };
            self.changed.wait_for(&mut state, wait);
        }
    }

    fn owned_condition<T>(
        &self,
        name: &str,
        operation: &str,
        f: impl FnOnce(&ConditionQueue) -> T,
    ) -> Result<T, LockError> {
        let state = self.state.lock();
        if !state.is_held_by(&self.node, ThreadToken::current().id()) {
            return Err(self.not_owner(operation));
        }
        state
            .conditions
            .get(name)
            .map(f)
            .ok_or_else(|| LockError::IllegalArgument(format!("unknown condition '{}'", name)))
    }

    pub(crate) fn has_waiters(&self, name: &str) -> Result<bool, LockError> {
        self.owned_condition(name, "has_waiters", |q| !q.waiters.is_empty())
    }

    pub(crate) fn wait_queue_length(&self, name: &str) -> Result<usize, LockError> {
        self.owned_condition(name, "wait_queue_length", |q| q.waiters.len())
    }
}

/// A named condition of a [`ClusterLock`].
///
/// Conditions with the same name on different nodes are the same condition:
/// a signal issued on one node wakes a waiter on another once the signaling
/// thread unlocks.
pub struct LockCondition<'a> {
    lock: &'a ClusterLock,
    name: String,
}

impl<'a> LockCondition<'a> {
    pub(crate) fn new(lock: &'a ClusterLock, name: String) -> Self {
        Self { lock, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock and wait until signaled or interrupted
    pub fn wait(&self) -> Result<(), LockError> {
        let sync = self.lock.sync()?;
        sync.await_condition(&self.name, AcquireMode::Interruptible)?;
        sync.validate(true)
    }

    /// Release the lock and wait until signaled; interrupts are deferred
    pub fn wait_uninterruptibly(&self) -> Result<(), LockError> {
        let sync = self.lock.sync()?;
        sync.await_condition(&self.name, AcquireMode::Uninterruptible)?;
        sync.validate(false)
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    /// Returns `false` if the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, LockError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => self.wait().map(|_| true),
        }
    }

    /// Like [`wait`](Self::wait), but gives up at `deadline`.
    /// Returns `false` if the deadline passed.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, LockError> {
        let sync = self.lock.sync()?;
        let signaled = sync.await_condition(&self.name, AcquireMode::Deadline(deadline))?;
        sync.validate(true)?;
        Ok(signaled)
    }

    /// Wake one waiter once the calling thread releases the lock
    pub fn signal(&self) -> Result<(), LockError> {
        self.lock.sync()?.signal(&self.name, false)
    }

    /// Wake every waiter once the calling thread releases the lock
    pub fn signal_all(&self) -> Result<(), LockError> {
        self.lock.sync()?.signal(&self.name, true)
    }
}

impl std::fmt::Debug for LockCondition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCondition")
            .field("lock", &self.lock.name())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relock_common::{LockConfig, lock_key};
    use relock_consistency::{GlobalLockState, LockStore, MemoryLockStore};

    use super::*;
    use crate::model::NodeContext;
    use crate::service::cluster::{ClusterMembership, InMemoryCluster};

    fn waiting_state(tickets: &[u64]) -> SyncState {
        let mut state = SyncState::default();
        let queue = state.conditions.entry("ready".to_string()).or_default();
        queue.waiters.extend(tickets.iter().copied());
        state
    }

    #[test]
    fn test_signal_wakes_oldest_waiter() {
        let mut state = waiting_state(&[7, 8]);
        assert!(state.signal_condition("ready", false));
        assert!(state.signaled.contains(&7));
        assert!(!state.signaled.contains(&8));
    }

    #[test]
    fn test_signal_all_and_unknown_condition() {
        let mut state = waiting_state(&[1, 2, 3]);
        assert!(!state.signal_condition("missing", true));
        assert!(state.signal_condition("ready", true));
        assert_eq!(state.signaled.len(), 3);
        assert!(!state.signal_condition("ready", true));
    }

    #[test]
    fn test_cancel_wait() {
        let mut state = waiting_state(&[1, 2]);
        state.signaled.insert(2);
        state.cancel_wait("ready", 2);
        assert!(!state.signaled.contains(&2));
        assert_eq!(state.conditions["ready"].waiters, VecDeque::from([1]));
    }

    #[test]
    fn test_outgoing_signals_coalesce() {
        let cluster = InMemoryCluster::new();
        let config = LockConfig {
            park_interval_ms: 1,
            tx_retry_delay_ms: 0,
            ..Default::default()
        };
        let store = Arc::new(MemoryLockStore::new(&config));
        let node: Arc<dyn ClusterMembership> = Arc::new(cluster.join());
        let ctx = NodeContext::new(node, store.clone(), config);
        let key = lock_key("cond");
        let record = store
            .put_if_absent(&key, GlobalLockState::new("cond", false, false))
            .unwrap();
        let sync = LocalSync::new(&key, ctx, &record);
        sync.new_condition("ready");

        let err = sync.signal("ready", false).unwrap_err();
        assert!(matches!(err, LockError::IllegalState { .. }));

        {
            let mut state = sync.state.lock();
            state.permits = 1;
            state.owner_node = Some(sync.node);
            state.owner_thread = ThreadToken::current().id();
        }
        sync.signal("ready", false).unwrap();
        sync.signal("ready", false).unwrap();
        assert_eq!(sync.state.lock().outgoing_signals["ready"], 2);

        sync.signal("ready", true).unwrap();
        sync.signal("ready", false).unwrap();
        assert_eq!(sync.state.lock().outgoing_signals["ready"], 0);

        assert!(!sync.has_waiters("ready").unwrap());
        assert_eq!(sync.wait_queue_length("ready").unwrap(), 0);
        assert!(matches!(
            sync.has_waiters("other"),
            Err(LockError::IllegalArgument(_))
        ));
    }
}
