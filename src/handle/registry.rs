//! Per-path lock registry: serializes size-changing operations
//! (`set_length`, rename-with-IV-rekey) across independent handles that
//! happen to share a plaintext path.
//!
//! A ref-counted map entry is acquired on lock, and `PathLockGuard::drop`
//! releases the entry's own mutex *before* decrementing its refcount and
//! touching the map — that explicit two-step order, rather than a borrowed
//! `MutexGuard`'s own drop timing, is what keeps a concurrent acquirer from
//! observing a refcount drop to zero while the path is still held.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct LockEntry {
    locked: Mutex<bool>,
    available: Condvar,
}

#[derive(Default)]
pub struct HandleRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<LockEntry>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `path`'s lock is free, then holds it until the returned
    /// guard is dropped. Creates the registry entry on first use.
    pub fn acquire(&self, path: &Path) -> PathLockGuard<'_> {
        let entry = {
            let mut entries = self.entries.lock().expect("registry mutex poisoned");
            entries
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(LockEntry::default()))
                .clone()
        };
        {
            let mut locked = entry.locked.lock().expect("path mutex poisoned");
            while *locked {
                locked = entry.available.wait(locked).expect("path mutex poisoned");
            }
            *locked = true;
        }
        PathLockGuard {
            entry,
            registry: self,
            path: path.to_path_buf(),
        }
    }

    /// Removes `path`'s entry if this guard was its last holder. Called
    /// while the guard still holds its own `Arc` clone, so "the map's clone
    /// plus this one" being the only two references means no other waiter
    /// is queued.
    fn release(&self, path: &Path, entry: &Arc<LockEntry>) {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if Arc::strong_count(entry) <= 2 {
            entries.remove(path);
        }
    }
}

/// RAII guard for a single path's lock. `drop` releases the path mutex
/// (unlock + wake one waiter) *before* touching the registry's map, matching
/// the reference implementation's unlock-then-release order.
pub struct PathLockGuard<'a> {
    entry: Arc<LockEntry>,
    registry: &'a HandleRegistry,
    path: PathBuf,
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        {
            let mut locked = self.entry.locked.lock().expect("path mutex poisoned");
            *locked = false;
        }
        self.entry.available.notify_one();
        self.registry.release(&self.path, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_path_serializes_across_handles() {
        let registry = Arc::new(HandleRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(thread::spawn(move || {
                let _lock = registry.acquire(Path::new("/shared/file.txt"));
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(2));
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let registry = HandleRegistry::new();
        let a = registry.acquire(Path::new("/a"));
        let b = registry.acquire(Path::new("/b"));
        drop(a);
        drop(b);
    }

    #[test]
    fn entry_is_removed_once_last_holder_drops() {
        let registry = HandleRegistry::new();
        {
            let _lock = registry.acquire(Path::new("/tmp/x"));
            assert_eq!(registry.entries.lock().unwrap().len(), 1);
        }
        assert_eq!(registry.entries.lock().unwrap().len(), 0);
    }
}
