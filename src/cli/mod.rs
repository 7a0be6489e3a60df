//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::Recurrence;

/// Concurrent test batch runner
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Run test batches with bounded concurrency, retries, caching and schedules")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a task file once
    Run(RunArgs),

    /// Manage recurring runs
    Schedule(ScheduleArgs),

    /// Manage remote workers
    Worker(WorkerArgs),

    /// View stored results
    Results(ResultsArgs),

    /// Show or create configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task file (YAML or JSON)
    pub tasks: PathBuf,

    /// Number of concurrent sessions
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Retry strategy (none, linear, exponential)
    #[arg(short, long)]
    pub retry: Option<String>,

    /// Maximum attempts per task
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Base retry delay in milliseconds
    #[arg(long)]
    pub base_delay_ms: Option<u64>,

    /// Calls per minute (0 = unlimited)
    #[arg(long)]
    pub rate_limit: Option<usize>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Persist results
    #[arg(short, long)]
    pub save: bool,

    /// Also write the formatted summary to a file
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Arguments for schedule command
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    #[command(subcommand)]
    pub action: ScheduleAction,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleAction {
    /// Add or replace a schedule
    Add {
        /// Schedule name
        name: String,

        /// Task file the schedule runs
        target: String,

        /// Recurrence (hourly, daily, weekly, interval)
        #[arg(short, long, default_value = "daily")]
        every: String,

        /// Time of day as HH:MM (daily, weekly)
        #[arg(long, default_value = "00:00")]
        at: String,

        /// Day of week, 0 = Monday (weekly)
        #[arg(long, default_value = "0")]
        weekday: u32,

        /// Minutes between runs (interval)
        #[arg(long, default_value = "60")]
        minutes: u32,

        /// Add the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a schedule
    Remove {
        /// Schedule name
        name: String,
    },

    /// List schedules
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Run the scheduler loop until interrupted
    Start {
        /// Partition runs across registered workers
        #[arg(long)]
        distributed: bool,
    },
}

/// Arguments for worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub action: WorkerAction,
}

#[derive(Subcommand, Debug)]
pub enum WorkerAction {
    /// Register or update a worker
    Register {
        /// Worker id
        id: String,

        /// host:port
        address: String,

        /// Accepted targets (comma-separated, empty accepts all)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Maximum parallel sessions on the worker
        #[arg(long, default_value = "3")]
        max_parallel: usize,
    },

    /// Remove a worker
    Unregister {
        /// Worker id
        id: String,
    },

    /// List registered workers
    List,

    /// Show how a task file would be partitioned
    Distribute {
        /// Task file
        tasks: PathBuf,

        /// Target name used for capability matching
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Check worker reachability
    Status,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    #[command(subcommand)]
    pub action: ResultsAction,
}

#[derive(Subcommand, Debug)]
pub enum ResultsAction {
    /// List stored runs
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show one run (latest when omitted)
    Show {
        /// Run id
        id: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Export a run to JSON or CSV
    Export {
        /// Run id
        id: String,

        /// Destination file
        output: PathBuf,

        /// json or csv (defaults to the file extension)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Delete a stored run
    Delete {
        /// Run id
        id: String,
    },
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Destination file
        #[arg(default_value = "conductor.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Build a validated [`Recurrence`] from `schedule add` flags
pub fn parse_recurrence(every: &str, at: &str, weekday: u32, minutes: u32) -> Result<Recurrence> {
    let time = || -> Result<(u32, u32)> {
        let (hour, minute) = at
            .split_once(':')
            .with_context(|| format!("Invalid time '{at}', expected HH:MM"))?;
        Ok((
            hour.trim().parse().with_context(|| format!("Invalid hour in '{at}'"))?,
            minute.trim().parse().with_context(|| format!("Invalid minute in '{at}'"))?,
        ))
    };

    let recurrence = match every.to_lowercase().as_str() {
        "hourly" => Recurrence::Hourly,
        "daily" => {
            let (hour, minute) = time()?;
            Recurrence::Daily { hour, minute }
        }
        "weekly" => {
            let (hour, minute) = time()?;
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            }
        }
        "interval" => Recurrence::Interval { minutes },
        other => bail!("Unknown recurrence '{other}'. Valid: hourly, daily, weekly, interval"),
    };
    recurrence.validate()?;
    Ok(recurrence)
}
