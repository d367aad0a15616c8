// ABOUTME: Lock module - advisory, file-based mutual exclusion per task directory.
// ABOUTME: Lock records carry a timestamp so abandoned locks can be reclaimed.

mod manager;

pub use manager::{LOCK_FILE_NAME, LockAcquisition, LockInfo, LockManager, LockRelease, LockStatus};
