//! Transactional store for shared lock records
//!
//! Provides:
//! - The `LockStore` contract used by lock handles
//! - Ordered change notification through `RecordListener`
//! - `MemoryLockStore`, a single-process implementation shared by all
//!   simulated nodes

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use relock_common::{LockConfig, StoreError, ThreadToken};
use tracing::{debug, info};

use super::model::GlobalLockState;
use super::retry::{RetryPolicy, retry_topology_safe};

/// Outcome of a transaction body
#[derive(Debug, Clone)]
pub enum TxAction {
    /// Commit the given record
    Put(GlobalLockState),
    /// Commit removal of the record
    Delete,
    /// Abandon the transaction without changes
    Rollback,
}

/// Transaction body: receives the current record (if any) and decides the outcome.
///
/// The body may run more than once when the store retries the transaction.
pub type TxBody<'a> = dyn FnMut(Option<GlobalLockState>) -> Result<TxAction, StoreError> + 'a;

/// Receives committed changes of a record.
///
/// Callbacks run synchronously on the committing thread, one at a time per
/// key and in commit order. They must not start transactions on the key they
/// observe.
pub trait RecordListener: Send + Sync {
    /// A new value of the record was committed
    fn on_update(&self, state: &GlobalLockState);

    /// The record was removed from the store
    fn on_removed(&self) {}
}

/// Handle returned by [`LockStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Shared transactional key/value store holding lock records
pub trait LockStore: Send + Sync {
    /// Read the committed record
    fn get(&self, key: &str) -> Result<Option<GlobalLockState>, StoreError>;

    /// Run `body` with exclusive access to the record under `key`.
    ///
    /// Returns whether a change was committed. Topology changes are retried
    /// internally; exhaustion surfaces as [`StoreError::RetriesExhausted`].
    fn transaction(&self, key: &str, body: &mut TxBody<'_>) -> Result<bool, StoreError>;

    /// Register a listener for committed changes of `key`.
    ///
    /// The store keeps only a weak reference.
    fn subscribe(&self, key: &str, listener: Weak<dyn RecordListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Store `state` unless a record already exists; returns the record in effect
    fn put_if_absent(&self, key: &str, state: GlobalLockState) -> Result<GlobalLockState, StoreError> {
        let mut in_effect = None;
        self.transaction(key, &mut |current| {
            Ok(match current {
                Some(existing) => {
                    in_effect = Some(existing);
                    TxAction::Rollback
                }
                None => {
                    in_effect = Some(state.clone());
                    TxAction::Put(state.clone())
                }
            })
        })?;
        in_effect.ok_or_else(|| StoreError::Unavailable(format!("no record produced for '{}'", key)))
    }

    /// Remove the record; returns whether it existed
    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.transaction(key, &mut |current| {
            Ok(match current {
                Some(_) => TxAction::Delete,
                None => TxAction::Rollback,
            })
        })
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub transactions: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub topology_retries: u64,
}

#[derive(Default)]
struct StoreStatsCollector {
    transactions: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    topology_retries: AtomicU64,
}

#[derive(Default)]
struct Slot {
    /// Serialized record; held for the whole transaction
    value: Mutex<Option<Vec<u8>>>,
    /// Taken before `value` is released so notifications leave in commit order
    notify: Mutex<()>,
}

struct Subscription {
    id: SubscriptionId,
    listener: Weak<dyn RecordListener>,
}

/// In-memory lock store with pessimistic per-key transactions.
///
/// Records are kept serialized, so every reader works on its own copy just as
/// it would with a remote store.
pub struct MemoryLockStore {
    slots: DashMap<String, Arc<Slot>>,
    subscriptions: DashMap<String, Vec<Subscription>>,
    next_subscription: AtomicU64,
    retry: RetryPolicy,
    park_interval: Duration,
    pending_topology_changes: AtomicU32,
    stopped: AtomicBool,
    stats: StoreStatsCollector,
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

impl MemoryLockStore {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            slots: DashMap::new(),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            retry: RetryPolicy::from(config),
            park_interval: config.park_interval(),
            pending_topology_changes: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            stats: StoreStatsCollector::default(),
        }
    }

    /// Make the next `count` transaction attempts fail with a topology change
    pub fn inject_topology_changes(&self, count: u32) {
        self.pending_topology_changes.fetch_add(count, Ordering::SeqCst);
    }

    /// Refuse all further transactions
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Lock store stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of live listeners registered for `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscriptions
            .get(key)
            .map(|subs| subs.iter().filter(|s| s.listener.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            transactions: self.stats.transactions.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
            rollbacks: self.stats.rollbacks.load(Ordering::Relaxed),
            topology_retries: self.stats.topology_retries.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        self.slots
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.is_stopped() {
            return Err(StoreError::Unavailable("lock store is stopped".to_string()));
        }
        Ok(())
    }

    /// Acquire the record lock, giving up if the calling thread is interrupted
    fn lock_value<'a>(
        &self,
        slot: &'a Slot,
        key: &str,
    ) -> Result<MutexGuard<'a, Option<Vec<u8>>>, StoreError> {
        if let Some(guard) = slot.value.try_lock() {
            return Ok(guard);
        }

        let token = ThreadToken::current();
        loop {
            if let Some(guard) = slot.value.try_lock_for(self.park_interval) {
                return Ok(guard);
            }
            if token.is_interrupted() {
                debug!(key = %key, "Interrupted while waiting for record lock");
                return Err(StoreError::Interrupted(key.to_string()));
            }
        }
    }

    fn attempt(&self, key: &str, body: &mut TxBody<'_>) -> Result<bool, StoreError> {
        self.ensure_running()?;

        let injected = self
            .pending_topology_changes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.stats.topology_retries.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::TopologyChanged(key.to_string()));
        }

        let slot = self.slot(key);
        let mut value = self.lock_value(&slot, key)?;
        let current = decode(value.as_deref())?;

        match body(current)? {
            TxAction::Rollback => {
                self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            TxAction::Put(state) => {
                *value = Some(serde_json::to_vec(&state)?);
                self.stats.commits.fetch_add(1, Ordering::Relaxed);

                let order = slot.notify.lock();
                drop(value);
                self.notify(key, |listener| listener.on_update(&state));
                drop(order);
                Ok(true)
            }
            TxAction::Delete => {
                let existed = value.take().is_some();
                self.stats.commits.fetch_add(1, Ordering::Relaxed);

                let order = slot.notify.lock();
                drop(value);
                if existed {
                    self.notify(key, |listener| listener.on_removed());
                }
                drop(order);
                Ok(existed)
            }
        }
    }

    fn notify(&self, key: &str, deliver: impl Fn(&dyn RecordListener)) {
        let listeners: Vec<Arc<dyn RecordListener>> = match self.subscriptions.get(key) {
            Some(subs) => subs.iter().filter_map(|s| s.listener.upgrade()).collect(),
            None => return,
        };

        for listener in listeners {
            deliver(listener.as_ref());
        }
    }
}

impl LockStore for MemoryLockStore {
    fn get(&self, key: &str) -> Result<Option<GlobalLockState>, StoreError> {
        self.ensure_running()?;
        let Some(slot) = self.slots.get(key).map(|s| s.clone()) else {
            return Ok(None);
        };
        let value = self.lock_value(&slot, key)?;
        decode(value.as_deref())
    }

    fn transaction(&self, key: &str, body: &mut TxBody<'_>) -> Result<bool, StoreError> {
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        retry_topology_safe(&self.retry, key, || self.attempt(key, body))
    }

    fn subscribe(&self, key: &str, listener: Weak<dyn RecordListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscriptions.entry(key.to_string()).or_default();
        subs.retain(|s| s.listener.strong_count() > 0);
        subs.push(Subscription { id, listener });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        for mut subs in self.subscriptions.iter_mut() {
            subs.retain(|s| s.id != id);
        }
    }
}

fn decode(bytes: Option<&[u8]>) -> Result<Option<GlobalLockState>, StoreError> {
    bytes
        .map(serde_json::from_slice::<GlobalLockState>)
        .transpose()
        .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        versions: Mutex<Vec<u64>>,
        removed: AtomicBool,
    }

    impl RecordListener for Recorder {
        fn on_update(&self, state: &GlobalLockState) {
            self.versions.lock().push(state.version);
        }

        fn on_removed(&self) {
            self.removed.store(true, Ordering::SeqCst);
        }
    }

    fn fast_store() -> MemoryLockStore {
        MemoryLockStore::new(&LockConfig {
            tx_max_retries: 2,
            tx_retry_delay_ms: 0,
            park_interval_ms: 1,
        })
    }

    fn bump(store: &MemoryLockStore, key: &str) -> Result<bool, StoreError> {
        store.transaction(key, &mut |current| {
            let mut state = current.unwrap_or_else(|| GlobalLockState::new(key, false, false));
            state.version += 1;
            Ok(TxAction::Put(state))
        })
    }

    #[test]
    fn test_put_if_absent() {
        let store = fast_store();
        let first = store
            .put_if_absent("k", GlobalLockState::new("k", true, false))
            .unwrap();
        assert!(first.fair);

        // Existing record wins
        let second = store
            .put_if_absent("k", GlobalLockState::new("k", false, true))
            .unwrap();
        assert!(second.fair);
        assert!(!second.failover_safe);
        assert_eq!(store.get("k").unwrap(), Some(first));
    }

    #[test]
    fn test_rollback_leaves_record() {
        let store = fast_store();
        assert!(!store.transaction("k", &mut |_| Ok(TxAction::Rollback)).unwrap());
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn test_listener_sees_commits_in_order() {
        let store = Arc::new(fast_store());
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn RecordListener> = Arc::downgrade(&recorder) as Weak<dyn RecordListener>;
        store.subscribe("k", weak);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        bump(&store, "k").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let versions = recorder.versions.lock().clone();
        assert_eq!(versions, (1..=100).collect::<Vec<u64>>());
    }

    #[test]
    fn test_remove_notifies() {
        let store = fast_store();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn RecordListener> = Arc::downgrade(&recorder) as Weak<dyn RecordListener>;
        let id = store.subscribe("k", weak);
        assert_eq!(store.subscriber_count("k"), 1);

        bump(&store, "k").unwrap();
        assert!(store.remove("k").unwrap());
        assert!(recorder.removed.load(Ordering::SeqCst));
        assert!(!store.remove("k").unwrap());

        store.unsubscribe(id);
        assert_eq!(store.subscriber_count("k"), 0);
    }

    #[test]
    fn test_dropped_listener_is_skipped() {
        let store = fast_store();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn RecordListener> = Arc::downgrade(&recorder) as Weak<dyn RecordListener>;
        store.subscribe("k", weak);
        drop(recorder);

        assert!(bump(&store, "k").unwrap());
        assert_eq!(store.subscriber_count("k"), 0);
    }

    #[test]
    fn test_topology_change_is_retried() {
        let store = fast_store();
        store.inject_topology_changes(2);
        assert!(bump(&store, "k").unwrap());
        assert_eq!(store.stats().topology_retries, 2);
    }

    #[test]
    fn test_topology_retries_exhausted() {
        let store = fast_store();
        store.inject_topology_changes(3);
        let err = bump(&store, "k").unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_stopped_store_refuses_work() {
        let store = fast_store();
        store.stop();
        assert!(matches!(bump(&store, "k"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.get("k"), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_interrupted_while_waiting_for_record() {
        let store = Arc::new(fast_store());
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .transaction("k", &mut |_| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(TxAction::Rollback)
                    })
                    .unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let (token_tx, token_rx) = mpsc::channel();
        let waiter = {
            let store = store.clone();
            thread::spawn(move || {
                token_tx.send(ThreadToken::current()).unwrap();
                bump(&store, "k")
            })
        };
        token_rx.recv().unwrap().interrupt();

        let result = waiter.join().unwrap();
        assert_eq!(result, Err(StoreError::Interrupted("k".to_string())));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
