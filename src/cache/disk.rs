//! Disk-backed cache tier
//!
//! One JSON file per entry, named by the SHA-256 of the key, so entries
//! survive process restarts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    value: serde_json::Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Persistent cache directory
#[derive(Clone, Debug)]
pub struct DiskCache {
    dir: PathBuf,
    default_ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, default_ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir, default_ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:x}.json", Sha256::digest(key.as_bytes())))
    }

    /// Value and remaining TTL, or `None` when missing, expired or unreadable
    pub fn get_with_ttl(&self, key: &str) -> Option<(serde_json::Value, Duration)> {
        let path = self.key_path(key);
        let content = fs::read_to_string(&path).ok()?;

        let entry: DiskEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Removing unreadable cache file {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                return None;
            }
        };

        // Hash collision guard
        if entry.key != key {
            return None;
        }

        // Expired files are dropped on read
        match (entry.expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => Some((entry.value, remaining)),
            _ => {
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    pub fn set(&self, key: &str, value: &serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let entry = DiskEntry {
            key: key.to_string(),
            value: value.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).context("TTL out of range")?,
        };

        let path = self.key_path(key);
        // Write-then-rename so concurrent readers never see a partial file
        let tmp = path.with_extension(format!("tmp{:08x}", rand::random::<u32>()));
        let content = serde_json::to_string(&entry).context("Failed to serialize cache entry")?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write cache file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move cache file: {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        fs::remove_file(self.key_path(key)).is_ok()
    }

    fn entry_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect()
    }

    pub fn clear(&self) -> Result<usize> {
        let files = self.entry_files();
        for path in &files {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
        }
        Ok(files.len())
    }

    /// Remove expired and unreadable files
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        for path in self.entry_files() {
            let expired = match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<DiskEntry>(&c).ok())
            {
                Some(entry) => entry.expires_at <= now,
                None => true,
            };

            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
        removed
    }

    /// (file count, total bytes)
    pub fn size_on_disk(&self) -> (usize, u64) {
        let files = self.entry_files();
        let bytes = files
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        (files.len(), bytes)
    }
}
