//! File-scoped locking with a write-worker semaphore and deadlock detection.

mod manager;
pub mod wait_graph;

pub use manager::{FileLock, LockKind, LockManager};
pub use wait_graph::WaitForGraph;
