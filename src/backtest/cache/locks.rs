//! Per-fingerprint mutual exclusion.
//!
//! A slot is created on first use and dropped from the table as soon as no
//! thread holds or waits on it, so the table only ever holds contended keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backtest::Fingerprint;

/// Recover the guard from a poisoned mutex; the protected data is plain bookkeeping.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub(crate) struct KeyedLocks {
    table: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Run `f` while holding the exclusive slot for `key`.
    pub fn with_lock<T>(&self, key: &Fingerprint, f: impl FnOnce() -> T) -> T {
        let slot = lock(&self.table).entry(key.clone()).or_default().clone();

        let out = {
            let _guard = lock(&slot);
            f()
        };

        let mut table = lock(&self.table);
        // ours plus the table's: nobody else is holding or queued on it
        if Arc::strong_count(&slot) == 2 {
            table.remove(key);
        }
        out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }
}
