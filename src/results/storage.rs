//! Results storage and retrieval
//!
//! Persists each run as one JSON file. Outcomes are upserted by task id, so
//! writing the same batch twice leaves the file unchanged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::ResultSink;
use crate::models::{Outcome, OutcomeStatus, RunSummary};

/// Stored run containing every outcome
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRun {
    /// Unique run ID
    pub id: String,

    /// What was run (tasks file, schedule target)
    pub target: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Pass rate (0.0 - 100.0)
    pub pass_rate: f64,

    /// Outcomes ordered by task id
    pub outcomes: Vec<Outcome>,

    pub environment: EnvironmentInfo,
}

/// Environment information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub tool_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME").ok(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StoredRun {
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            target: target.into(),
            started_at: now,
            completed_at: now,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            pass_rate: 0.0,
            outcomes: Vec::new(),
            environment: EnvironmentInfo::default(),
        }
    }

    /// Merge outcomes by task id and refresh the counters
    pub fn upsert(&mut self, outcomes: &[Outcome]) {
        let mut merged: BTreeMap<String, Outcome> = self
            .outcomes
            .drain(..)
            .map(|o| (o.task_id.clone(), o))
            .collect();
        for outcome in outcomes {
            merged.insert(outcome.task_id.clone(), outcome.clone());
        }
        self.outcomes = merged.into_values().collect();

        let count = |status| self.outcomes.iter().filter(|o| o.status == status).count();
        self.total = self.outcomes.len();
        self.succeeded = count(OutcomeStatus::Success);
        self.failed = count(OutcomeStatus::Failed);
        self.skipped = count(OutcomeStatus::Skipped);
        self.pass_rate = if self.total > 0 {
            (self.succeeded as f64 / self.total as f64) * 100.0
        } else {
            0.0
        };

        if let Some(first) = self.outcomes.iter().map(|o| o.started_at).min() {
            self.started_at = self.started_at.min(first);
        }
        self.completed_at = Utc::now();
    }

    pub fn to_summary(&self) -> RunSummary {
        let duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        RunSummary::new(self.id.clone(), self.outcomes.clone(), duration_ms)
    }
}

/// Generate unique run ID
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

/// Results storage manager
#[derive(Clone, Debug)]
pub struct ResultsStorage {
    /// Base directory for results
    base_dir: PathBuf,
}

impl ResultsStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Platform data directory
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("conductor")
            .join("results")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create results directory: {}", self.base_dir.display())
        })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.run_path(run_id).exists()
    }

    /// Save a run
    pub fn save(&self, run: &StoredRun) -> Result<PathBuf> {
        self.ensure_dir()?;

        let path = self.run_path(&run.id);
        let file = File::create(&path).context("Failed to create results file")?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, run).context("Failed to write results")?;

        debug!("Saved run {} to {}", run.id, path.display());
        Ok(path)
    }

    /// Load a run
    pub fn load(&self, run_id: &str) -> Result<StoredRun> {
        let path = self.run_path(run_id);
        let run = self
            .load_from_path(&path)
            .with_context(|| format!("Run not found: {run_id}"))?;
        debug!("Loaded run {} from {}", run_id, path.display());
        Ok(run)
    }

    pub fn load_from_path(&self, path: &Path) -> Result<StoredRun> {
        let file = File::open(path).context("Failed to open results file")?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).context("Failed to parse results")
    }

    /// Merge `outcomes` into the stored run, creating it if needed
    pub fn upsert(&self, run_id: &str, target: &str, outcomes: &[Outcome]) -> Result<PathBuf> {
        let mut run = if self.exists(run_id) {
            self.load(run_id)?
        } else {
            StoredRun::new(run_id, target)
        };
        run.upsert(outcomes);
        self.save(&run)
    }

    fn load_all(&self) -> Result<Vec<StoredRun>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match self.load_from_path(&path) {
                    Ok(run) => runs.push(run),
                    Err(e) => {
                        debug!("Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        // Newest first
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Brief info for every stored run, newest first
    pub fn list_runs(&self) -> Result<Vec<RunInfo>> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|run| RunInfo {
                id: run.id,
                target: run.target,
                started_at: run.started_at,
                total: run.total,
                pass_rate: run.pass_rate,
            })
            .collect())
    }

    pub fn latest(&self) -> Result<Option<StoredRun>> {
        Ok(self.load_all()?.into_iter().next())
    }

    pub fn delete(&self, run_id: &str) -> Result<bool> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!("Deleted results: {}", path.display());
        Ok(true)
    }

    /// Sink writing one run's flushes into this storage
    pub fn sink(&self, run_id: impl Into<String>, target: impl Into<String>) -> RunSink {
        RunSink {
            storage: self.clone(),
            run_id: run_id.into(),
            target: target.into(),
        }
    }

    /// Export run to a file
    pub fn export(&self, run: &StoredRun, path: &Path, format: ExportFormat) -> Result<()> {
        match format {
            ExportFormat::Json => {
                let file = File::create(path)?;
                let writer = BufWriter::new(file);
                serde_json::to_writer_pretty(writer, run)?;
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_path(path)?;

                writer.write_record([
                    "task_id",
                    "category",
                    "status",
                    "attempts",
                    "duration_ms",
                    "cached",
                    "error",
                ])?;

                for outcome in &run.outcomes {
                    writer.write_record([
                        outcome.task_id.clone(),
                        outcome.category.clone(),
                        outcome.status.to_string(),
                        outcome.attempt_count.to_string(),
                        outcome.duration_ms().to_string(),
                        outcome.cached.to_string(),
                        outcome.error.clone().unwrap_or_default(),
                    ])?;
                }
                writer.flush()?;
            }
        }

        info!("Exported results to {}", path.display());
        Ok(())
    }
}

/// [`ResultSink`] bound to one stored run
#[derive(Clone, Debug)]
pub struct RunSink {
    storage: ResultsStorage,
    run_id: String,
    target: String,
}

impl RunSink {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[async_trait]
impl ResultSink for RunSink {
    async fn write_batch(&mut self, outcomes: &[Outcome]) -> Result<()> {
        let path = self.storage.upsert(&self.run_id, &self.target, outcomes)?;
        info!("Saved {} outcome(s) to {}", outcomes.len(), path.display());
        Ok(())
    }
}

/// Brief run information
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub pass_rate: f64,
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}
