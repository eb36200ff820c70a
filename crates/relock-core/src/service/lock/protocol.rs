// Global state protocol
// The three transactions that move a lock's shared record: ownership
// compare-and-set, release publish and fair queue join/leave

use std::collections::HashMap;

use relock_common::{LockError, NodeId, ThreadToken};
use relock_consistency::{AcquireRequest, ReleaseRequest, TxAction};
use tracing::{debug, error, info};

use super::sync::LocalSync;

/// Result of an ownership compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CasOutcome {
    /// Committed; the record now has this version
    Acquired(u64),
    /// Lost the race or overtaken by a queued node
    Rejected,
    /// Lock broken while the transaction was running
    Aborted,
}

/// Result of a release publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishOutcome {
    Published(u64),
    Aborted,
}

impl LocalSync {
    fn not_found(&self) -> LockError {
        LockError::NotFound(self.name.clone())
    }

    /// Take ownership of the shared record if it is free or its owner's node
    /// is dead.
    pub(crate) fn compare_and_set_global_state(
        &self,
        new_value: u32,
        token: &ThreadToken,
        barging_prohibited: bool,
    ) -> Result<CasOutcome, LockError> {
        let request = AcquireRequest {
            expected: 0,
            new_value,
            node: self.node,
            thread: token.id(),
            barging_prohibited,
            requester_queued: self.waiting_threads.contains(&token.id()),
        };
        let is_alive = |node: &NodeId| self.ctx.is_alive(node);

        let mut missing = false;
        let mut committed = None;
        let result = self.ctx.store.transaction(&self.key, &mut |current| {
            let Some(mut state) = current else {
                missing = true;
                return Ok(TxAction::Rollback);
            };
            missing = false;

            if state.compare_and_set(&request, &is_alive) {
                committed = Some(state.version);
                Ok(TxAction::Put(state))
            } else {
                committed = None;
                Ok(TxAction::Rollback)
            }
        });

        match result {
            Ok(_) if missing => Err(self.not_found()),
            Ok(true) => {
                let Some(version) = committed else {
                    return Ok(CasOutcome::Rejected);
                };
                self.waiting_threads.remove(&token.id());
                debug!(lock = %self.name, node = %self.node, thread = token.id(), "Lock acquired");
                metrics::counter!("relock_lock_acquired_total", "lock" => self.name.clone())
                    .increment(1);
                Ok(CasOutcome::Acquired(version))
            }
            Ok(false) => {
                metrics::counter!("relock_cas_rejected_total", "lock" => self.name.clone())
                    .increment(1);
                Ok(CasOutcome::Rejected)
            }
            Err(e) => {
                if self.interrupted_all() {
                    info!(
                        lock = %self.name,
                        "Node is stopped (or lock is broken in non-failover safe mode), aborting transaction"
                    );
                    return Ok(CasOutcome::Aborted);
                }
                if e.is_interrupted() || token.is_interrupted() {
                    info!(lock = %self.name, "Thread is interrupted while attempting to acquire lock");
                    // Let the blocking layer decide what the interrupt means
                    self.wake_pass();
                    return Ok(CasOutcome::Rejected);
                }
                error!(lock = %self.name, error = %e, "Failed to compare and set");
                Err(LockError::transaction(&self.name, e))
            }
        }
    }

    /// Publish a release by this node, delivering pending signals and
    /// registering the releasing thread as a condition waiter if it is about
    /// to wait.
    pub(crate) fn set_global_state(
        &self,
        new_value: u32,
        last_condition: Option<String>,
        outgoing_signals: HashMap<String, u32>,
    ) -> Result<PublishOutcome, LockError> {
        let request = ReleaseRequest {
            new_value,
            node: self.node,
            outgoing_signals,
            last_condition,
        };
        let is_alive = |node: &NodeId| self.ctx.is_alive(node);

        let mut missing = false;
        let mut violation = None;
        let mut committed = 0;
        let result = self.ctx.store.transaction(&self.key, &mut |current| {
            let Some(mut state) = current else {
                missing = true;
                return Ok(TxAction::Rollback);
            };
            missing = false;

            match state.release(&request, &is_alive) {
                Ok(()) => {
                    violation = None;
                    committed = state.version;
                    Ok(TxAction::Put(state))
                }
                Err(reason) => {
                    violation = Some(reason);
                    Ok(TxAction::Rollback)
                }
            }
        });

        match result {
            Ok(_) if missing => Err(self.not_found()),
            Ok(_) => {
                if let Some(reason) = violation {
                    error!(lock = %self.name, node = %self.node, reason = %reason, "Fair queue violated on release");
                    return Err(LockError::QueueViolation {
                        lock: self.name.clone(),
                        reason,
                    });
                }
                debug!(lock = %self.name, node = %self.node, "Lock released");
                metrics::counter!("relock_lock_released_total", "lock" => self.name.clone())
                    .increment(1);
                Ok(PublishOutcome::Published(committed))
            }
            Err(e) => {
                if self.interrupted_all() {
                    info!(
                        lock = %self.name,
                        "Node is stopped (or lock is broken in non-failover safe mode), aborting transaction"
                    );
                    return Ok(PublishOutcome::Aborted);
                }
                error!(lock = %self.name, error = %e, "Failed to release");
                Err(LockError::transaction(&self.name, e))
            }
        }
    }

    /// Join (`cancelled == false`) or leave the shared fair queue on behalf
    /// of `token`'s thread.
    ///
    /// Leaving is a no-op for threads that never joined. Interruption while
    /// the transaction waits is deferred: the flag is cleared, the transaction
    /// retried, and the flag restored afterwards.
    pub(crate) fn synchronize_queue(
        &self,
        cancelled: bool,
        token: &ThreadToken,
    ) -> Result<bool, LockError> {
        let mut interrupted = false;
        let result = self.synchronize_queue_retrying(cancelled, token, &mut interrupted);
        if interrupted {
            token.interrupt();
        }
        result
    }

    fn synchronize_queue_retrying(
        &self,
        cancelled: bool,
        token: &ThreadToken,
        interrupted: &mut bool,
    ) -> Result<bool, LockError> {
        loop {
            if cancelled && !self.waiting_threads.contains(&token.id()) {
                return Ok(false);
            }

            let mut missing = false;
            let result = self.ctx.store.transaction(&self.key, &mut |current| {
                let Some(mut state) = current else {
                    missing = true;
                    return Ok(TxAction::Rollback);
                };
                missing = false;

                if cancelled {
                    state.leave(&self.node);
                } else {
                    state.enqueue(self.node);
                }
                Ok(TxAction::Put(state))
            });

            match result {
                Ok(_) if missing => return Err(self.not_found()),
                Ok(_) => {
                    if cancelled {
                        self.waiting_threads.remove(&token.id());
                    } else {
                        self.waiting_threads.insert(token.id());
                    }
                    debug!(lock = %self.name, node = %self.node, thread = token.id(), cancelled, "Fair queue synchronized");
                    metrics::counter!("relock_queue_sync_total", "lock" => self.name.clone())
                        .increment(1);
                    return Ok(true);
                }
                Err(e) => {
                    if self.interrupted_all() {
                        info!(
                            lock = %self.name,
                            "Node is stopped (or lock is broken in non-failover safe mode), aborting transaction"
                        );
                        self.wake_pass();
                        return Ok(false);
                    }
                    if e.is_interrupted() || token.is_interrupted() {
                        token.take_interrupt();
                        *interrupted = true;
                        debug!(lock = %self.name, "Thread got interrupted while synchronizing the fair queue, retrying");
                        continue;
                    }
                    error!(lock = %self.name, error = %e, "Failed to synchronize fair queue");
                    return Err(LockError::transaction(&self.name, e));
                }
            }
        }
    }
}
