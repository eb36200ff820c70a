//! Shared reentrant lock record
//!
//! One `GlobalLockState` exists per lock name and is replicated to every node
//! through the store. All mutations happen inside a store transaction, so the
//! methods here are pure record rewrites: they never block and never touch the
//! network.

use std::collections::{HashMap, VecDeque};

use relock_common::{NO_THREAD, NodeId};
use serde::{Deserialize, Serialize};

/// Shared state of one reentrant lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalLockState {
    /// Lock name
    pub name: String,
    /// Hold count of the owning thread (0 = free)
    #[serde(default)]
    pub permits: u32,
    /// Node of the owning thread
    #[serde(default)]
    pub owner_node: Option<NodeId>,
    /// Owning thread id on `owner_node`
    #[serde(default)]
    pub owner_thread: u64,
    /// Whether acquisitions are granted in node arrival order
    pub fair: bool,
    /// Whether a surviving node may take over after the owner's node dies
    pub failover_safe: bool,
    /// Fair-mode arrival queue; the head is the current or next owner's node
    #[serde(default)]
    pub queue: VecDeque<NodeId>,
    /// Per condition, the nodes that have a thread waiting on it, oldest first
    #[serde(default)]
    pub condition_waiters: HashMap<String, VecDeque<NodeId>>,
    /// Signals produced by the last release, per receiving node
    #[serde(default)]
    pub pending_signals: HashMap<NodeId, Vec<String>>,
    /// Whether the last committed mutation changed ownership or the queue head
    #[serde(default)]
    pub changed: bool,
    /// Incremented on every committed mutation
    #[serde(default)]
    pub version: u64,
    /// Creation timestamp (Unix millis)
    pub created_at: i64,
    /// Last update timestamp (Unix millis)
    pub updated_at: i64,
}

/// Parameters of an ownership compare-and-set
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Permits the caller believes are currently held
    pub expected: u32,
    /// Permits after a successful swap
    pub new_value: u32,
    pub node: NodeId,
    pub thread: u64,
    /// Refuse to overtake queued nodes in fair mode
    pub barging_prohibited: bool,
    /// Whether the requesting thread already has an entry in the fair queue
    pub requester_queued: bool,
}

/// Parameters of a release publish
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    /// Permits left after the release (0 = lock becomes free)
    pub new_value: u32,
    pub node: NodeId,
    /// Signals to deliver, per condition; a count of 0 means all waiters
    pub outgoing_signals: HashMap<String, u32>,
    /// Condition the releasing thread is about to wait on
    pub last_condition: Option<String>,
}

impl GlobalLockState {
    pub fn new(name: impl Into<String>, fair: bool, failover_safe: bool) -> Self {
        let now = current_timestamp();
        Self {
            name: name.into(),
            permits: 0,
            owner_node: None,
            owner_thread: NO_THREAD,
            fair,
            failover_safe,
            queue: VecDeque::new(),
            condition_waiters: HashMap::new(),
            pending_signals: HashMap::new(),
            changed: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.permits != 0
    }

    pub fn is_owned_by(&self, node: &NodeId, thread: u64) -> bool {
        self.is_locked() && self.owner_node.as_ref() == Some(node) && self.owner_thread == thread
    }

    /// Whether some other live node is ahead of `node` in the fair queue.
    ///
    /// Dead nodes in front of the first live one are dropped from the queue.
    pub fn has_predecessor(&mut self, node: &NodeId, is_alive: &dyn Fn(&NodeId) -> bool) -> bool {
        if !self.fair {
            return false;
        }

        while let Some(front) = self.queue.front() {
            if is_alive(front) {
                return front != node;
            }
            self.queue.pop_front();
        }
        false
    }

    /// Swap the permit count from `expected` to `new_value` on behalf of the
    /// requesting thread.
    ///
    /// The expected value is ignored when the recorded owner's node is dead,
    /// which is how a surviving node takes over a failover-safe lock. Returns
    /// `false` (leaving the record untouched apart from queue pruning) when the
    /// swap is refused.
    pub fn compare_and_set(
        &mut self,
        request: &AcquireRequest,
        is_alive: &dyn Fn(&NodeId) -> bool,
    ) -> bool {
        if request.barging_prohibited && self.has_predecessor(&request.node, is_alive) {
            return false;
        }

        let owner_dead = self.owner_node.as_ref().is_some_and(|owner| !is_alive(owner));
        if self.permits != request.expected && !owner_dead {
            return false;
        }

        self.permits = request.new_value;
        self.owner_node = Some(request.node);
        self.owner_thread = request.thread;
        self.pending_signals.clear();

        if self.fair {
            let push = self.queue.is_empty()
                || !request.barging_prohibited
                || !request.requester_queued;
            if push {
                if request.requester_queued {
                    // Barging past our own slot: the slot moves to the head
                    remove_last(&mut self.queue, &request.node);
                }
                self.queue.push_front(request.node);
            }
        }

        self.touch(true);
        true
    }

    /// Publish a release by `request.node`.
    ///
    /// When the lock becomes free in fair mode, the queue head is popped and
    /// must be the releasing node; otherwise the record is left untouched and
    /// the violation is returned. Signals are dequeued from the condition
    /// waiter lists (dead nodes are skipped without using up the count) and
    /// replace `pending_signals`.
    pub fn release(
        &mut self,
        request: &ReleaseRequest,
        is_alive: &dyn Fn(&NodeId) -> bool,
    ) -> Result<(), String> {
        if self.fair && request.new_value == 0 {
            match self.queue.front() {
                Some(front) if *front == request.node => {
                    self.queue.pop_front();
                }
                Some(front) => {
                    return Err(format!(
                        "queue head is {} but releasing node is {}",
                        front, request.node
                    ));
                }
                None => {
                    return Err(format!(
                        "queue is empty on release by node {}",
                        request.node
                    ));
                }
            }
        }

        self.permits = request.new_value;
        if request.new_value == 0 {
            self.owner_node = None;
            self.owner_thread = NO_THREAD;
        }

        let mut conditions: Vec<&String> = request.outgoing_signals.keys().collect();
        conditions.sort();

        let mut deliveries: HashMap<NodeId, Vec<String>> = HashMap::new();
        for condition in conditions {
            let count = request.outgoing_signals[condition];
            let Some(waiters) = self.condition_waiters.get_mut(condition) else {
                continue;
            };

            let mut remaining = if count == 0 {
                waiters.len()
            } else {
                count as usize
            };
            while remaining > 0 {
                let Some(node) = waiters.pop_front() else {
                    break;
                };
                if !is_alive(&node) {
                    continue;
                }
                deliveries.entry(node).or_default().push(condition.clone());
                remaining -= 1;
            }

            if waiters.is_empty() {
                self.condition_waiters.remove(condition);
            }
        }
        self.pending_signals = deliveries;

        if let Some(condition) = &request.last_condition {
            self.condition_waiters
                .entry(condition.clone())
                .or_default()
                .push_back(request.node);
        }

        self.touch(true);
        Ok(())
    }

    /// Append `node` to the fair queue
    pub fn enqueue(&mut self, node: NodeId) {
        self.queue.push_back(node);
        self.touch(false);
    }

    /// Remove the last occurrence of `node` from the fair queue.
    ///
    /// Returns whether the removed entry was the queue head, in which case the
    /// record is marked as changed so other nodes re-evaluate the new head.
    pub fn leave(&mut self, node: &NodeId) -> bool {
        let head = remove_last(&mut self.queue, node) == Some(0);
        if head {
            // Already delivered with the previous change
            self.pending_signals.clear();
        }
        self.touch(head);
        head
    }

    /// Number of queue entries held by `node`
    pub fn queued_entries(&self, node: &NodeId) -> usize {
        self.queue.iter().filter(|n| *n == node).count()
    }

    fn touch(&mut self, changed: bool) {
        self.changed = changed;
        self.version += 1;
        self.updated_at = current_timestamp();
    }
}

fn remove_last(queue: &mut VecDeque<NodeId>, node: &NodeId) -> Option<usize> {
    let index = queue.iter().rposition(|n| n == node)?;
    queue.remove(index);
    Some(index)
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn all_alive(_: &NodeId) -> bool {
        true
    }

    fn acquire(node: NodeId, thread: u64, expected: u32, new_value: u32) -> AcquireRequest {
        AcquireRequest {
            expected,
            new_value,
            node,
            thread,
            barging_prohibited: true,
            requester_queued: false,
        }
    }

    fn release(node: NodeId, new_value: u32) -> ReleaseRequest {
        ReleaseRequest {
            new_value,
            node,
            outgoing_signals: HashMap::new(),
            last_condition: None,
        }
    }

    #[test]
    fn test_compare_and_set_and_release() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("orders", false, false);

        assert!(state.compare_and_set(&acquire(n1, 1, 0, 1), &all_alive));
        assert!(state.is_owned_by(&n1, 1));
        assert!(state.changed);
        assert_eq!(state.version, 1);

        // Second node expects a free lock - refused
        assert!(!state.compare_and_set(&acquire(n2, 7, 0, 1), &all_alive));
        assert!(state.is_owned_by(&n1, 1));
        assert_eq!(state.version, 1);

        // Reentrant increment
        assert!(state.compare_and_set(&acquire(n1, 1, 1, 2), &all_alive));
        assert_eq!(state.permits, 2);

        state.release(&release(n1, 1), &all_alive).unwrap();
        assert!(state.is_owned_by(&n1, 1));
        state.release(&release(n1, 0), &all_alive).unwrap();
        assert!(!state.is_locked());
        assert_eq!(state.owner_node, None);
        assert_eq!(state.owner_thread, NO_THREAD);

        assert!(state.compare_and_set(&acquire(n2, 7, 0, 1), &all_alive));
        assert!(state.is_owned_by(&n2, 7));
    }

    #[test]
    fn test_fair_queue_order() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);

        // Empty queue: first acquirer takes the head slot
        assert!(state.compare_and_set(&acquire(n1, 1, 0, 1), &all_alive));
        assert_eq!(state.queue, VecDeque::from([n1]));

        state.enqueue(n2);
        assert!(!state.changed);
        assert!(state.has_predecessor(&n2, &all_alive));

        state.release(&release(n1, 0), &all_alive).unwrap();
        assert_eq!(state.queue, VecDeque::from([n2]));
        assert!(!state.has_predecessor(&n2, &all_alive));

        // n2 is queued and at the head: no extra entry is pushed
        let mut request = acquire(n2, 3, 0, 1);
        request.requester_queued = true;
        assert!(state.compare_and_set(&request, &all_alive));
        assert_eq!(state.queue, VecDeque::from([n2]));
    }

    #[test]
    fn test_fair_refuses_overtaking() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);
        state.enqueue(n1);

        assert!(!state.compare_and_set(&acquire(n2, 1, 0, 1), &all_alive));
        assert!(!state.is_locked());
    }

    #[test]
    fn test_barging_moves_own_slot_to_head() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);
        state.enqueue(n1);
        state.enqueue(n2);

        let request = AcquireRequest {
            barging_prohibited: false,
            requester_queued: true,
            ..acquire(n2, 4, 0, 1)
        };
        assert!(state.compare_and_set(&request, &all_alive));
        assert_eq!(state.queue, VecDeque::from([n2, n1]));
    }

    #[test]
    fn test_dead_predecessors_are_pruned() {
        let dead = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);
        state.enqueue(dead);
        state.enqueue(n2);

        let is_alive = |n: &NodeId| *n != dead;
        assert!(!state.has_predecessor(&n2, &is_alive));
        assert_eq!(state.queue, VecDeque::from([n2]));
    }

    #[test]
    fn test_takeover_from_dead_owner() {
        let dead = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("safe", false, true);
        assert!(state.compare_and_set(&acquire(dead, 1, 0, 3), &all_alive));

        let is_alive = |n: &NodeId| *n != dead;
        assert!(state.compare_and_set(&acquire(n2, 9, 0, 1), &is_alive));
        assert!(state.is_owned_by(&n2, 9));
        assert_eq!(state.permits, 1);
    }

    #[test]
    fn test_release_queue_violation() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);
        assert!(state.compare_and_set(&acquire(n1, 1, 0, 1), &all_alive));
        let before = state.clone();

        let err = state.release(&release(n2, 0), &all_alive).unwrap_err();
        assert!(err.contains(&n1.to_string()));
        assert_eq!(state, before);
    }

    #[test]
    fn test_signal_delivery() {
        let owner = NodeId::random();
        let w1 = NodeId::random();
        let w2 = NodeId::random();
        let dead = NodeId::random();
        let mut state = GlobalLockState::new("cond", false, false);
        state.condition_waiters.insert("ready".to_string(), VecDeque::from([dead, w1, w2]));
        assert!(state.compare_and_set(&acquire(owner, 1, 0, 1), &all_alive));

        // Signal one: the dead node is skipped without using up the count
        let is_alive = |n: &NodeId| *n != dead;
        let mut request = release(owner, 0);
        request.outgoing_signals.insert("ready".to_string(), 1);
        state.release(&request, &is_alive).unwrap();
        assert_eq!(state.pending_signals.len(), 1);
        assert_eq!(state.pending_signals[&w1], vec!["ready".to_string()]);
        assert_eq!(state.condition_waiters["ready"], VecDeque::from([w2]));

        // Next acquisition clears the pending signals
        assert!(state.compare_and_set(&acquire(owner, 1, 0, 1), &all_alive));
        assert!(state.pending_signals.is_empty());

        // Signal all drains the list
        let mut request = release(owner, 0);
        request.outgoing_signals.insert("ready".to_string(), 0);
        state.release(&request, &is_alive).unwrap();
        assert_eq!(state.pending_signals[&w2], vec!["ready".to_string()]);
        assert!(!state.condition_waiters.contains_key("ready"));
    }

    #[test]
    fn test_release_registers_condition_waiter() {
        let n1 = NodeId::random();
        let mut state = GlobalLockState::new("cond", true, false);
        assert!(state.compare_and_set(&acquire(n1, 1, 0, 2), &all_alive));

        let mut request = release(n1, 0);
        request.last_condition = Some("ready".to_string());
        state.release(&request, &all_alive).unwrap();
        assert_eq!(state.condition_waiters["ready"], VecDeque::from([n1]));
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_leave_marks_change_only_at_head() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let mut state = GlobalLockState::new("fair", true, false);
        state.enqueue(n1);
        state.enqueue(n2);
        state.enqueue(n1);

        // Last occurrence of n1 is at the tail
        assert!(!state.leave(&n1));
        assert!(!state.changed);
        assert_eq!(state.queue, VecDeque::from([n1, n2]));

        state.pending_signals.insert(n2, vec!["c".to_string()]);
        assert!(state.leave(&n1));
        assert!(state.changed);
        assert!(state.pending_signals.is_empty());

        // Leaving without an entry commits a no-op
        let version = state.version;
        assert!(!state.leave(&n1));
        assert_eq!(state.version, version + 1);
    }

    #[test]
    fn test_serde_round_trip_with_missing_fields() {
        let json = r#"{"name":"legacy","fair":true,"failover_safe":false,"created_at":1,"updated_at":2}"#;
        let state: GlobalLockState = serde_json::from_str(json).unwrap();
        assert_eq!(state.permits, 0);
        assert!(state.queue.is_empty());
        assert_eq!(state.owner_node, None);
    }

    proptest::proptest! {
        // Fair queue: every node that enqueues and is then granted the lock
        // releases in arrival order.
        #[test]
        fn prop_fair_grants_follow_arrival(count in 1usize..8) {
            let nodes: Vec<NodeId> = (0..count).map(|_| NodeId::random()).collect();
            let mut state = GlobalLockState::new("fair", true, false);
            for node in &nodes {
                state.enqueue(*node);
            }

            let mut granted = Vec::new();
            while granted.len() < count {
                let mut winners = HashSet::new();
                for (i, node) in nodes.iter().enumerate() {
                    let request = AcquireRequest {
                        requester_queued: true,
                        ..acquire(*node, i as u64 + 1, 0, 1)
                    };
                    if state.compare_and_set(&request, &all_alive) {
                        winners.insert(*node);
                        granted.push(*node);
                        state.release(&release(*node, 0), &all_alive).unwrap();
                        break;
                    }
                }
                proptest::prop_assert_eq!(winners.len(), 1);
            }
            proptest::prop_assert_eq!(granted, nodes);
        }
    }
}
