//! Lazy content access for a loaded archive and a bounded cache of parsed
//! trees.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{PakError, Result};
use crate::index::{ArchiveEntry, EntryLocation};

/// Serves entry bytes and text, keeping a copy of packed entries under
/// `cache_dir` so each one leaves its container at most once.
///
/// A failed cache write is logged and disables the disk cache; later reads
/// go back to the container.
pub struct ContentCache {
    cache_dir: PathBuf,
    disabled: AtomicBool,
}

impl ContentCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn bytes(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        if let EntryLocation::Extracted(path) = &entry.location {
            return Ok(fs::read(path)?);
        }

        let cached = self.cached_path(&entry.entry_name);
        if !self.disabled.load(Ordering::Relaxed) && cached.is_file() {
            return Ok(fs::read(&cached)?);
        }

        let bytes = entry.read()?;
        if !self.disabled.load(Ordering::Relaxed) {
            if let Err(e) = self.store(&cached, &bytes) {
                tracing::warn!(
                    entry = %entry.entry_name,
                    error = %e,
                    "Could not write content cache, reading from the archive from now on"
                );
                self.disabled.store(true, Ordering::Relaxed);
            }
        }
        Ok(bytes)
    }

    /// Entry content as UTF-8 text.
    pub fn text(&self, entry: &ArchiveEntry) -> Result<String> {
        let bytes = self.bytes(entry)?;
        String::from_utf8(bytes).map_err(|_| PakError::NotText(entry.entry_name.clone()))
    }

    fn cached_path(&self, entry_name: &str) -> PathBuf {
        entry_name
            .split('/')
            .fold(self.cache_dir.clone(), |path, part| path.join(part))
    }

    /// tmp + rename so concurrent readers never see a partial file.
    fn store(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            ".{}.{}.tmp",
            file_name,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }
}

struct Slot<T> {
    created: Instant,
    value: Mutex<Option<Arc<T>>>,
}

/// Bounded get-or-compute cache keyed by entry name.
///
/// Concurrent misses on the same key run the computation once; every waiter
/// gets the same `Arc`. Slots expire after `ttl`, and the oldest slot is
/// evicted when `max_entries` is reached. Failed computations are not
/// stored.
pub struct TreeCache<T> {
    slots: DashMap<String, Arc<Slot<T>>>,
    max_entries: usize,
    ttl: Duration,
}

impl<T> TreeCache<T> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    pub fn get_or_compute<E, F>(&self, key: &str, compute: F) -> std::result::Result<Arc<T>, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let slot = self.slot(key);
        let mut value = slot.value.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = value.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let computed = Arc::new(compute()?);
        *value = Some(Arc::clone(&computed));
        Ok(computed)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        if slot.created.elapsed() > self.ttl {
            return None;
        }
        let value = slot.value.lock().unwrap_or_else(|e| e.into_inner());
        value.clone()
    }

    pub fn invalidate(&self, key: &str) {
        self.slots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: &str) -> Arc<Slot<T>> {
        if let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) {
            if slot.created.elapsed() <= self.ttl {
                return slot;
            }
            self.slots
                .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        }

        self.evict();
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Slot {
                created: Instant::now(),
                value: Mutex::new(None),
            })
        });
        Arc::clone(slot.value())
    }

    fn evict(&self) {
        let ttl = self.ttl;
        self.slots.retain(|_, slot| slot.created.elapsed() <= ttl);

        while self.slots.len() >= self.max_entries {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|s| s.value().created)
                .map(|s| s.key().clone());
            match oldest {
                Some(key) => {
                    tracing::debug!(key = %key, "Evicting cached tree");
                    self.slots.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::write_zip;
    use crate::index::ArchiveIndex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_content_cache_copies_packed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let pak = dir.path().join("data0.pak");
        write_zip(&pak, &[("scripts/a.scr", b"int x = 1;")]);
        let index = ArchiveIndex::index(&pak, &dir.path().join("scratch")).unwrap();
        let cache = ContentCache::new(dir.path().join("cache"));

        let entry = index.get("scripts/a.scr").unwrap();
        assert_eq!(cache.text(entry).unwrap(), "int x = 1;");
        let cached = dir.path().join("cache").join("scripts").join("a.scr");
        assert_eq!(fs::read(&cached).unwrap(), b"int x = 1;");

        // Served from disk even once the container is gone.
        fs::remove_file(&pak).unwrap();
        assert_eq!(cache.text(entry).unwrap(), "int x = 1;");
    }

    #[test]
    fn test_cache_write_failure_falls_back_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let pak = dir.path().join("data0.pak");
        write_zip(&pak, &[("scripts/a.scr", b"abc")]);
        let index = ArchiveIndex::index(&pak, &dir.path().join("scratch")).unwrap();

        // A plain file where the cache directory should be.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let cache = ContentCache::new(&blocked);

        let entry = index.get("scripts/a.scr").unwrap();
        assert_eq!(cache.bytes(entry).unwrap(), b"abc");
        assert_eq!(cache.bytes(entry).unwrap(), b"abc");
    }

    #[test]
    fn test_non_utf8_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pak = dir.path().join("data0.pak");
        write_zip(&pak, &[("a.scr", &[0xffu8, 0xfe, 0x00][..])]);
        let index = ArchiveIndex::extract_all(&pak, &dir.path().join("out")).unwrap();
        let cache = ContentCache::new(dir.path().join("cache"));
        let err = cache.text(index.get("a.scr").unwrap()).unwrap_err();
        assert!(matches!(err, PakError::NotText(_)));
    }

    #[test]
    fn test_concurrent_miss_computes_once() {
        let cache = Arc::new(TreeCache::<String>::new(8, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    cache
                        .get_or_compute("scripts/a.scr", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok::<_, ()>("tree".to_string())
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let cache = TreeCache::<u32>::new(4, Duration::from_secs(60));
        let first: std::result::Result<Arc<u32>, &str> = cache.get_or_compute("k", || Err("bad"));
        assert!(first.is_err());
        let second = cache.get_or_compute("k", || Ok::<_, &str>(7)).unwrap();
        assert_eq!(*second, 7);
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let cache = TreeCache::<u32>::new(2, Duration::from_secs(60));
        cache.get_or_compute("a", || Ok::<_, ()>(1)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_compute("b", || Ok::<_, ()>(2)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_compute("c", || Ok::<_, ()>(3)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").as_deref(), Some(&3));
    }

    #[test]
    fn test_expired_slots_recompute() {
        let cache = TreeCache::<u32>::new(4, Duration::from_millis(10));
        cache.get_or_compute("a", || Ok::<_, ()>(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a").is_none());
        let again = cache.get_or_compute("a", || Ok::<_, ()>(2)).unwrap();
        assert_eq!(*again, 2);
    }
}
