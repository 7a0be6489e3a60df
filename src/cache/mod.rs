//! Cache layer
//!
//! Deduplicates idempotent lookups across workers. An in-memory TTL/LRU tier
//! is consulted first, then an optional disk tier whose hits are promoted
//! back into memory.

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::{CacheStats, MemoryCache};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Memory tier backed by an optional disk tier
#[derive(Debug)]
pub struct TieredCache {
    memory: Arc<MemoryCache<Value>>,
    disk: Option<DiskCache>,
}

impl TieredCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            memory: Arc::new(MemoryCache::new(max_entries, default_ttl)),
            disk: None,
        }
    }

    pub fn with_disk(mut self, disk: DiskCache) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn memory(&self) -> &MemoryCache<Value> {
        &self.memory
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// Lookup; returns the value and whether it was a hit
    pub fn get(&self, key: &str) -> (Option<Value>, bool) {
        if let Some(value) = self.memory.get(key) {
            return (Some(value), true);
        }

        if let Some(disk) = &self.disk {
            if let Some((value, remaining)) = disk.get_with_ttl(key) {
                debug!("Promoting disk cache hit {} into memory", key);
                self.memory.set(key, value.clone(), Some(remaining));
                return (Some(value), true);
            }
        }

        (None, false)
    }

    /// Async lookup for worker tasks; the disk tier is read on the blocking pool
    pub async fn fetch(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.memory.get(key) {
            return Some(value);
        }

        let disk = self.disk.clone()?;
        let owned = key.to_string();
        match tokio::task::spawn_blocking(move || disk.get_with_ttl(&owned)).await {
            Ok(Some((value, remaining))) => {
                debug!("Promoting disk cache hit {} into memory", key);
                self.memory.set(key, value.clone(), Some(remaining));
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Disk cache lookup for {} failed: {}", key, e);
                None
            }
        }
    }

    /// Async counterpart of [`set`](Self::set)
    pub async fn store(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Some(disk) = self.disk.clone() {
            let owned = key.to_string();
            let entry = value.clone();
            match tokio::task::spawn_blocking(move || disk.set(&owned, &entry, ttl)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Disk cache write failed for {}: {:#}", key, e),
                Err(e) => warn!("Disk cache write for {} did not complete: {}", key, e),
            }
        }
        self.memory.set(key, value, ttl);
    }

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.set(key, &value, ttl) {
                warn!("Disk cache write failed for {}: {:#}", key, e);
            }
        }
        self.memory.set(key, value, ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        let in_memory = self.memory.delete(key);
        let on_disk = self.disk.as_ref().map(|d| d.delete(key)).unwrap_or(false);
        in_memory || on_disk
    }

    pub fn clear(&self) {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear() {
                warn!("Failed to clear disk cache: {:#}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.stats()
    }

    /// Background TTL sweep of the memory tier
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        self.memory.spawn_sweeper(interval, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_memory_only() {
        let cache = TieredCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get("k"), (None, false));
        cache.set("k", json!(1), None);
        assert_eq!(cache.get("k"), (Some(json!(1)), true));
    }

    #[test]
    fn test_disk_hit_promoted() {
        let dir = tempdir().unwrap();
        let disk = DiskCache::new(dir.path(), Duration::from_secs(60)).unwrap();
        disk.set("k", &json!("persisted"), None).unwrap();

        let cache = TieredCache::new(10, Duration::from_secs(60)).with_disk(disk);
        assert!(cache.memory().is_empty());

        assert_eq!(cache.get("k"), (Some(json!("persisted")), true));
        assert_eq!(cache.memory().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_and_store_across_tiers() {
        let dir = tempdir().unwrap();
        let disk = DiskCache::new(dir.path(), Duration::from_secs(60)).unwrap();
        let cache = TieredCache::new(10, Duration::from_secs(60)).with_disk(disk.clone());

        assert_eq!(cache.fetch("k").await, None);
        cache.store("k", json!({ "v": 1 }), None).await;
        assert_eq!(disk.get("k"), Some(json!({ "v": 1 })));

        cache.memory().clear();
        assert_eq!(cache.fetch("k").await, Some(json!({ "v": 1 })));
        assert_eq!(cache.memory().len(), 1);
    }

    #[test]
    fn test_set_writes_both_tiers() {
        let dir = tempdir().unwrap();
        let disk = DiskCache::new(dir.path(), Duration::from_secs(60)).unwrap();
        let cache = TieredCache::new(10, Duration::from_secs(60)).with_disk(disk);

        cache.set("k", json!(42), None);
        assert_eq!(cache.disk().and_then(|d| d.get("k")), Some(json!(42)));

        assert!(cache.delete("k"));
        assert_eq!(cache.get("k"), (None, false));
    }
}
