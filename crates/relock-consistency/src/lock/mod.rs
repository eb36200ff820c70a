//! Reentrant lock record and store
//!
//! This module provides:
//! - Shared lock record and its mutation rules
//! - Store contract with change notification
//! - Retry on topology change
//! - In-memory store implementation

mod model;
mod retry;
mod store;

pub use model::*;
pub use retry::*;
pub use store::*;
