use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// In-process keyed locks. A caller takes its whole key set at once or
/// nothing, so waiters never hold a partial set.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<BTreeSet<String>>,
    released: Condvar,
}

/// Releases its keys on drop, on every exit path.
#[derive(Debug)]
pub(crate) struct LockGuard<'a> {
    table: &'a LockTable,
    keys: BTreeSet<String>,
}

impl LockTable {
    /// Wait up to `timeout` for every key in `keys` to be free, then take
    /// them all. `None` on timeout.
    pub(crate) fn acquire(
        &self,
        keys: BTreeSet<String>,
        timeout: Duration,
    ) -> Option<LockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while keys.iter().any(|key| held.contains(key)) {
            if self.released.wait_until(&mut held, deadline).timed_out()
                && keys.iter().any(|key| held.contains(key))
            {
                return None;
            }
        }
        held.extend(keys.iter().cloned());
        Some(LockGuard { table: self, keys })
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

impl LockGuard<'_> {
    pub(crate) fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.table.released.notify_all();
    }
}
