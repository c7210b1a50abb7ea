//! Extension trait to ignore mutex poisoning.
//!
//! The registries guarded by std mutexes in this crate (per-device locks, pending
//! permission requests, notification receivers) hold plain maps that stay consistent
//! even if a holder panicked, so poison carries no information for them.

use std::sync::{Mutex, MutexGuard};

pub trait IgnorePoison<T> {
    /// Locks the mutex, ignoring poison.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}
