//! Thread identity and cooperative interruption
//!
//! Lock ownership is recorded per thread in the shared record, which needs a
//! stable integer id. Every OS thread lazily receives a process-unique id
//! (starting at 1; `0` means "no thread") and an interrupt flag that blocking
//! lock operations poll while parked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Thread id recorded when a lock is free.
pub const NO_THREAD: u64 = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadToken = ThreadToken::fresh();
}

/// Handle to a thread's identity and interrupt flag.
///
/// Tokens are cheap to clone and may be sent to other threads, which can then
/// interrupt the owning thread.
#[derive(Clone, Debug)]
pub struct ThreadToken {
    id: u64,
    interrupted: Arc<AtomicBool>,
}

impl ThreadToken {
    fn fresh() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|t| t.clone())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Set the interrupt flag. Blocking operations observe it on their next poll.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the interrupt flag, returning whether it was set.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

impl PartialEq for ThreadToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadToken {}

/// Id of the calling thread.
pub fn current_thread_id() -> u64 {
    CURRENT.with(|t| t.id)
}
