// Distributed reentrant lock
//
// sync      - local synchronizer: cached ownership, local wait queue, blocking
// protocol  - transactions against the shared lock record
// condition - named conditions with cross-node signaling
// facade    - the public lock handle and its record/membership listeners
// manager   - per-node lock lifecycle

mod condition;
mod facade;
mod manager;
mod protocol;
mod sync;

pub use condition::LockCondition;
pub use facade::{ClusterLock, LockRef};
pub use manager::LockManager;
