use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;

/// Lazily created per-key mutexes.
///
/// A key's mutex exists only while someone holds or waits on it; the last user out
/// removes it from the table.
#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self { Self::default() }

    /// Run `f` while holding the mutex for `key`. The entry is released even if `f` panics.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut t = self.table.lock();
            t.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let entry = Entry { locks: self, key, lock };
        let _g = entry.lock.lock();
        f()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize { self.table.lock().len() }
    pub fn is_empty(&self) -> bool { self.table.lock().is_empty() }
}

/// One holder's claim on a table entry; dropping it removes the entry once unused.
struct Entry<'a> {
    locks: &'a KeyLocks,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        // Clones are only handed out under the table lock, so a count of two (table + ours)
        // seen here means nobody else is holding or waiting.
        let mut t = self.locks.table.lock();
        if Arc::strong_count(&self.lock) == 2 {
            t.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn locks_are_dropped_when_uncontended() {
        let locks = KeyLocks::new();
        locks.with_lock("a", || assert_eq!(locks.len(), 1));
        assert!(locks.is_empty());
    }

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
                scope.spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock("k", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn panicking_holder_still_releases_entry() {
        let locks = KeyLocks::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_lock("boom", || panic!("holder failed"))
        }));
        assert!(res.is_err());
        assert!(locks.is_empty());
        // the key is usable again afterwards
        assert_eq!(locks.with_lock("boom", || 7), 7);
        assert!(locks.is_empty());
    }

    #[test]
    fn different_keys_do_not_block_each_other() {
        let locks = KeyLocks::new();
        locks.with_lock("a", || {
            // nested acquisition of another key would deadlock under a single global lock
            locks.with_lock("b", || assert_eq!(locks.len(), 2));
        });
        assert!(locks.is_empty());
    }
}
