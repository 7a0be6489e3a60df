//! Output formatters for run results
//!
//! Provides table, JSON, CSV and one-line summary output.

use anyhow::{Context, Result};
use std::io::Write;

use crate::models::{Outcome, OutcomeStatus, RunSummary, ScheduleConfig};
use crate::results::RunInfo;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn status_label(&self, status: OutcomeStatus) -> String {
        let label = format!("{} {}", status.symbol(), status);
        if !self.colorize {
            return label;
        }
        let color = match status {
            OutcomeStatus::Success => "32",
            OutcomeStatus::Failed => "31",
            OutcomeStatus::Skipped => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    /// Format a single outcome
    pub fn format_outcome(&self, outcome: &Outcome) -> String {
        match self.format {
            OutputFormat::Table => self.format_outcome_row(outcome),
            OutputFormat::Json => serde_json::to_string(outcome).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Csv => self.csv(std::slice::from_ref(outcome)),
            OutputFormat::Summary => outcome.to_string(),
        }
    }

    fn format_outcome_row(&self, outcome: &Outcome) -> String {
        let mut row = format!(
            "{:24} {:12} {} [{:>6}ms] x{}",
            outcome.task_id,
            outcome.category,
            self.status_label(outcome.status),
            outcome.duration_ms(),
            outcome.attempt_count
        );
        if outcome.cached {
            row.push_str(" (cached)");
        }
        if let Some(error) = &outcome.error {
            row.push_str(&format!("  {error}"));
        }
        row
    }

    /// Format a run summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Csv => self.csv(&summary.outcomes),
            OutputFormat::Summary => format!(
                "Run {}: {}/{} succeeded, {} failed, {} skipped ({:.1}%) in {}ms",
                summary.run_id,
                summary.succeeded,
                summary.total,
                summary.failed,
                summary.skipped,
                summary.pass_rate(),
                summary.duration_ms
            ),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!("║  Run {:56} ║\n", summary.run_id));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        for outcome in &summary.outcomes {
            output.push_str(&format!("  {}\n", self.format_outcome_row(outcome)));
        }

        output.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        let failed = if self.colorize && summary.failed > 0 {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };
        output.push_str(&format!(
            "  Total: {} | Success: {} | Failed: {} | Skipped: {} | Attempts: {}\n",
            summary.total, summary.succeeded, failed, summary.skipped, summary.total_attempts
        ));
        output.push_str(&format!(
            "  Pass Rate: {:.1}% | Duration: {}ms | Retries: {}\n",
            summary.pass_rate(),
            summary.duration_ms,
            summary.total_retries
        ));
        if let Some(d) = &summary.durations {
            output.push_str(&format!(
                "  Task Time: avg {:.0}ms | min {}ms | max {}ms\n",
                d.avg_ms, d.min_ms, d.max_ms
            ));
        }

        if !summary.workers.is_empty() {
            output.push_str("\n  Workers:\n");
            for w in &summary.workers {
                output.push_str(&format!(
                    "    #{:<3} {:>4} task(s) {:>5} attempt(s)\n",
                    w.worker, w.tasks_completed, w.attempts
                ));
            }
        }

        output
    }

    fn csv(&self, outcomes: &[Outcome]) -> String {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let _ = writer.write_record([
            "task_id",
            "category",
            "status",
            "attempts",
            "duration_ms",
            "cached",
            "error",
        ]);
        for outcome in outcomes {
            let _ = writer.write_record([
                outcome.task_id.clone(),
                outcome.category.clone(),
                outcome.status.to_string(),
                outcome.attempt_count.to_string(),
                outcome.duration_ms().to_string(),
                outcome.cached.to_string(),
                outcome.error.clone().unwrap_or_default(),
            ]);
        }
        writer
            .into_inner()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    /// Format the stored run listing
    pub fn format_runs(&self, runs: &[RunInfo]) -> String {
        if matches!(self.format, OutputFormat::Json | OutputFormat::JsonPretty) {
            let rows: Vec<_> = runs
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "target": r.target,
                        "started_at": r.started_at,
                        "total": r.total,
                        "pass_rate": r.pass_rate,
                    })
                })
                .collect();
            return if self.format == OutputFormat::JsonPretty {
                serde_json::to_string_pretty(&rows).unwrap_or_default()
            } else {
                serde_json::to_string(&rows).unwrap_or_default()
            };
        }

        if runs.is_empty() {
            return "No stored runs".to_string();
        }

        let mut output = format!(
            "{:24} {:30} {:20} {:>6} {:>7}\n",
            "RUN", "TARGET", "STARTED", "TASKS", "PASS"
        );
        for run in runs {
            output.push_str(&format!(
                "{:24} {:30} {:20} {:>6} {:>6.1}%\n",
                run.id,
                run.target,
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.total,
                run.pass_rate
            ));
        }
        output
    }

    /// Format the schedule listing
    pub fn format_schedules(&self, schedules: &[ScheduleConfig]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(schedules).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(schedules).unwrap_or_default(),
            _ if schedules.is_empty() => "No schedules".to_string(),
            _ => {
                let mut output = String::new();
                for s in schedules {
                    let next = s
                        .next_run
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    output.push_str(&format!(
                        "{} {:20} {:30} {:22} next {}\n",
                        if s.enabled { "●" } else { "○" },
                        s.name,
                        s.target,
                        s.recurrence.to_string(),
                        next
                    ));
                }
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

/// Write a run summary to a file
pub fn write_summary_to_file(path: &str, summary: &RunSummary, format: OutputFormat) -> Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_summary(summary);

    let mut file = std::fs::File::create(path).with_context(|| format!("Failed to create {path}"))?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkerStats;
    use chrono::Utc;
    use serde_json::json;

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary::new(
            "run-1",
            vec![
                Outcome::success("login", json!(1), 1, now),
                Outcome::failed("search", "timeout, twice", 3, now),
            ],
            42,
        )
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::from_str("unknown"), None);
    }

    #[test]
    fn test_formatter_creation() {
        let formatter = ResultFormatter::new(OutputFormat::Json).no_color();
        assert_eq!(formatter.format, OutputFormat::Json);
        assert!(!formatter.colorize);
    }

    #[test]
    fn test_table_summary() {
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_summary(&summary());
        assert!(output.contains("run-1"));
        assert!(output.contains("✗ FAILED"));
        assert!(output.contains("Pass Rate: 50.0%"));
    }

    #[test]
    fn test_table_shows_performance_and_workers() {
        let summary = summary().with_workers(vec![
            WorkerStats {
                worker: 0,
                tasks_completed: 1,
                attempts: 1,
                current_task: None,
            },
            WorkerStats {
                worker: 1,
                tasks_completed: 1,
                attempts: 3,
                current_task: None,
            },
        ]);
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_summary(&summary);

        assert!(output.contains("Retries: 2"));
        assert!(output.contains("Task Time: avg"));
        assert!(output.contains("Workers:"));
        assert!(output.contains("#1      1 task(s)     3 attempt(s)"));
    }

    #[test]
    fn test_csv_quotes_errors() {
        let output = ResultFormatter::new(OutputFormat::Csv).format_summary(&summary());
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("task_id,category,status"));
        assert!(lines[2].ends_with("\"timeout, twice\""));
    }

    #[test]
    fn test_json_summary() {
        let output = ResultFormatter::new(OutputFormat::Json).format_summary(&summary());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["failed"], 1);
    }

    #[test]
    fn test_one_line_summary() {
        let output = ResultFormatter::new(OutputFormat::Summary).format_summary(&summary());
        assert!(output.starts_with("Run run-1: 1/2 succeeded"));
    }
}
