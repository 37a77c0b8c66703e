//! Per-boot-session mutual exclusion.
//!
//! A boot session is keyed by its output directory joined with the boot id,
//! the same stem its archive and metadata record share. Two work items for
//! the same session must not interleave their archive append or metadata
//! rewrite. Items for different sessions proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Keyed locks, one per boot session currently in use.
///
/// Entries are dropped once no execution holds or waits on them, so the map
/// only grows with the number of concurrently active sessions.
#[derive(Debug, Clone, Default)]
pub struct BootLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl BootLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `session`.
    pub fn with_lock<R>(&self, session: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.get_session_lock(session);
        let result = {
            // A panic in another holder cannot leave `()` inconsistent
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release_session_lock(session, lock);
        result
    }

    /// Number of sessions with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn get_session_lock(&self, session: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(session.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_session_lock(&self, session: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_serialized() {
        let locks = BootLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    locks.with_lock(Path::new("out/X"), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = BootLocks::new();
        let result = locks.with_lock(Path::new("out/A"), || {
            locks.with_lock(Path::new("out/B"), || 42)
        });
        assert_eq!(result, 42);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_same_boot_id_in_other_directory_does_not_block() {
        let locks = BootLocks::new();
        let result = locks.with_lock(Path::new("data/D1/X"), || {
            locks.with_lock(Path::new("data/D2/X"), || locks.active())
        });
        assert_eq!(result, 2);
        assert_eq!(locks.active(), 0);
    }
}
