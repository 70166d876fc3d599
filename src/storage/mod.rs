//! Storage primitives shared by the registry and the message logs.
//!
//! Everything on disk goes through [`AtomicFileStore`], and every mutation
//! happens inside a [`LockManager`] scope.

mod atomic;
mod layout;
mod lock;

pub use atomic::{backup_path, tmp_path, AtomicFileStore};
pub use layout::{sanitize_id, StoreLayout};
pub use lock::{LockGuard, LockKey, LockManager};
