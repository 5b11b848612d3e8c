//! Record locking.

mod lock;
mod locker;

pub use lock::{LockGrant, LockTable, LockType};
pub use locker::{LockResult, Locker, WriteLockInfo};
