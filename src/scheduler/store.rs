//! Schedule and worker persistence
//!
//! Both registries are small JSON documents rewritten on every change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{ScheduleConfig, WorkerInfo};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkerFile {
    #[serde(default)]
    workers: Vec<WorkerInfo>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// `schedules.json`
#[derive(Clone, Debug)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        config_dir().join("schedules.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no schedules
    pub fn load(&self) -> Result<Vec<ScheduleConfig>> {
        let file: ScheduleFile = read_json(&self.path)?;
        debug!("Loaded {} schedule(s) from {}", file.schedules.len(), self.path.display());
        Ok(file.schedules)
    }

    pub fn save(&self, schedules: &[ScheduleConfig]) -> Result<()> {
        write_json(
            &self.path,
            &ScheduleFile {
                schedules: schedules.to_vec(),
            },
        )
    }
}

/// `workers.json`
#[derive(Clone, Debug)]
pub struct WorkerStore {
    path: PathBuf,
}

impl WorkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        config_dir().join("workers.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<WorkerInfo>> {
        let file: WorkerFile = read_json(&self.path)?;
        Ok(file.workers)
    }

    pub fn save(&self, workers: &[WorkerInfo]) -> Result<()> {
        write_json(
            &self.path,
            &WorkerFile {
                workers: workers.to_vec(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Recurrence;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("nested/schedules.json"));
        let schedules = vec![
            ScheduleConfig::new("nightly", "smoke.yaml", Recurrence::Daily { hour: 2, minute: 30 }),
            ScheduleConfig::new("poll", "api.yaml", Recurrence::Interval { minutes: 15 }).disabled(),
        ];
        store.save(&schedules).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\"schedules\""));
        assert!(content.contains("\"type\": \"daily\""));
        assert_eq!(store.load().unwrap(), schedules);
    }

    #[test]
    fn test_worker_roundtrip() {
        let dir = tempdir().unwrap();
        let store = WorkerStore::new(dir.path().join("workers.json"));
        let workers = vec![WorkerInfo::new("w1", "10.0.0.5:5000", vec!["api".to_string()])];
        store.save(&workers).unwrap();
        assert_eq!(store.load().unwrap(), workers);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workers.json");
        fs::write(&path, "not json").unwrap();
        assert!(WorkerStore::new(path).load().is_err());
    }
}
