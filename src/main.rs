//! conductor - concurrent test batch runner
//!
//! Runs task files through a bounded pool of sessions with retries, rate
//! limiting and caching, and fires them on recurring schedules, optionally
//! partitioned across remote workers.
//!
//! ## Usage
//!
//! ```bash
//! # Run a task file with 4 sessions and keep the results
//! conductor run smoke.yaml -n 4 --save
//!
//! # Nightly schedule at 02:30
//! conductor schedule add nightly suite.yaml --every daily --at 02:30
//! conductor schedule start
//!
//! # Partition across workers
//! conductor worker register w1 10.0.0.1:5000
//! conductor schedule start --distributed
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use test_conductor::cli::{self, Args, Command};
use test_conductor::config::{AppConfig, EnvConfig};
use test_conductor::executor::RetryStrategy;
use test_conductor::models::{ScheduleConfig, WorkerInfo};
use test_conductor::output::{write_summary_to_file, OutputFormat, ResultFormatter};
use test_conductor::pipeline::{load_tasks, Pipeline, RunOptions};
use test_conductor::results::ExportFormat;
use test_conductor::scheduler::{DistributedCoordinator, HttpWorkerTransport, ScheduleCoordinator};
use test_conductor::utils::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(LogLevel::from_verbose(args.verbose));

    let config = AppConfig::resolve(args.config.as_deref())?;

    match args.command {
        Command::Run(run_args) => run(config, run_args).await?,
        Command::Schedule(schedule_args) => manage_schedules(config, schedule_args).await?,
        Command::Worker(worker_args) => manage_workers(config, worker_args).await?,
        Command::Results(results_args) => show_results(config, results_args)?,
        Command::Config(config_args) => manage_config(config, args.config.as_deref(), config_args)?,
    }

    Ok(())
}

fn formatter(format: &str) -> ResultFormatter {
    ResultFormatter::new(OutputFormat::from_str(format).unwrap_or(OutputFormat::Table))
}

async fn run(mut config: AppConfig, args: cli::RunArgs) -> Result<()> {
    let exec = &mut config.execution;
    if let Some(name) = &args.retry {
        exec.retry_strategy = RetryStrategy::from_str(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown retry strategy: {}", name))?;
    }
    if let Some(attempts) = args.max_attempts {
        exec.max_attempts = attempts;
    }
    if let Some(delay) = args.base_delay_ms {
        exec.base_delay_ms = delay;
        exec.max_delay_ms = exec.max_delay_ms.max(delay);
    }
    if let Some(limit) = args.rate_limit {
        exec.rate_limit_per_minute = limit;
    }
    if let Some(concurrency) = args.concurrency {
        exec.concurrency = concurrency;
    }
    config.validate()?;

    let pipeline = Pipeline::from_config(config)?;
    pipeline.spawn_cache_sweeper();

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        save: args.save,
        ..RunOptions::default()
    };
    let summary = pipeline.run_file(&args.tasks, &options, None).await?;
    pipeline.cancel();

    let format = OutputFormat::from_str(&args.format).unwrap_or(OutputFormat::Table);
    println!("{}", ResultFormatter::new(format).format_summary(&summary));

    if let Some(path) = &args.output {
        write_summary_to_file(path, &summary, format)?;
        info!("Summary written to {}", path);
    }

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn manage_schedules(config: AppConfig, args: cli::ScheduleArgs) -> Result<()> {
    let tick = Duration::from_secs(config.scheduler.tick_secs);
    let store = config.scheduler.schedule_store();

    match args.action {
        cli::ScheduleAction::Add {
            name,
            target,
            every,
            at,
            weekday,
            minutes,
            disabled,
        } => {
            let recurrence = cli::parse_recurrence(&every, &at, weekday, minutes)?;
            let mut schedule = ScheduleConfig::new(&name, target, recurrence);
            if disabled {
                schedule = schedule.disabled();
            }

            let coordinator = ScheduleCoordinator::with_store(Pipeline::from_config(config)?, store)?;
            coordinator.add_schedule(schedule)?;
            if let Some(added) = coordinator.list_schedules().iter().find(|s| s.name == name) {
                println!(
                    "Schedule '{}' ({}) next run: {}",
                    added.name,
                    added.recurrence,
                    added
                        .next_run
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        cli::ScheduleAction::Remove { name } => {
            let coordinator = ScheduleCoordinator::with_store(Pipeline::from_config(config)?, store)?;
            if coordinator.remove_schedule(&name) {
                println!("Removed schedule '{name}'");
            } else {
                bail!("Schedule '{}' not found", name);
            }
        }
        cli::ScheduleAction::List { format } => {
            let schedules = store.load()?;
            println!("{}", formatter(&format).format_schedules(&schedules));
        }
        cli::ScheduleAction::Start { distributed } => {
            let mut pipeline = Pipeline::from_config(config.clone())?;
            if distributed {
                let workers = DistributedCoordinator::with_store(config.scheduler.worker_store())?
                    .with_ack_timeout(Duration::from_secs(config.scheduler.ack_timeout_secs));
                let transport = HttpWorkerTransport::new(config.scheduler.ack_timeout_secs)?;
                info!("Distributing across {} worker(s)", workers.list_workers().len());
                pipeline = pipeline.with_remote(Arc::new(workers), Arc::new(transport));
            }
            let sweeper_cancel = pipeline.cancel_token();
            pipeline.spawn_cache_sweeper();

            let coordinator = ScheduleCoordinator::with_store(pipeline, store)?.with_tick(tick);
            coordinator.start_background();
            println!("Scheduler running, press Ctrl+C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Stopping scheduler");
            coordinator.stop().await;
            sweeper_cancel.cancel();
        }
    }

    Ok(())
}

async fn manage_workers(config: AppConfig, args: cli::WorkerArgs) -> Result<()> {
    let mut coordinator = DistributedCoordinator::with_store(config.scheduler.worker_store())?;

    match args.action {
        cli::WorkerAction::Register {
            id,
            address,
            capabilities,
            max_parallel,
        } => {
            let mut worker = WorkerInfo::new(&id, address, capabilities);
            worker.max_parallel = max_parallel.max(1);
            coordinator.register_worker(worker)?;
            println!("Registered worker '{id}'");
        }
        cli::WorkerAction::Unregister { id } => {
            if !coordinator.unregister_worker(&id)? {
                bail!("Worker '{}' not found", id);
            }
            println!("Unregistered worker '{id}'");
        }
        cli::WorkerAction::List => {
            let workers = coordinator.list_workers();
            if workers.is_empty() {
                println!("No workers registered");
            }
            for worker in workers {
                let caps = if worker.capabilities.is_empty() {
                    "*".to_string()
                } else {
                    worker.capabilities.join(",")
                };
                println!(
                    "{:16} {:22} max {} [{}]",
                    worker.id, worker.address, worker.max_parallel, caps
                );
            }
        }
        cli::WorkerAction::Distribute { tasks, target } => {
            let target = target.unwrap_or_else(|| tasks.display().to_string());
            let plan = coordinator.distribute_tasks(&load_tasks(&tasks)?, &target);
            for (worker, share) in &plan {
                let ids: Vec<&str> = share.iter().map(|t| t.id.as_str()).collect();
                println!("{:16} {:>4} task(s): {}", worker, share.len(), ids.join(", "));
            }
        }
        cli::WorkerAction::Status => {
            print!("{}", coordinator.cluster_status().await);
        }
    }

    Ok(())
}

fn show_results(config: AppConfig, args: cli::ResultsArgs) -> Result<()> {
    let storage = config.results.storage();

    match args.action {
        cli::ResultsAction::List { format } => {
            println!("{}", formatter(&format).format_runs(&storage.list_runs()?));
        }
        cli::ResultsAction::Show { id, format } => {
            let run = match id {
                Some(id) => storage.load(&id)?,
                None => match storage.latest()? {
                    Some(run) => run,
                    None => bail!("No stored runs in {}", storage.base_dir().display()),
                },
            };
            println!("Target: {}", run.target);
            println!("{}", formatter(&format).format_summary(&run.to_summary()));
        }
        cli::ResultsAction::Export { id, output, format } => {
            let format = match format {
                Some(name) => ExportFormat::from_str(&name),
                None => ExportFormat::from_extension(&output),
            }
            .ok_or_else(|| anyhow::anyhow!("Cannot determine export format, use --format json|csv"))?;
            let run = storage.load(&id)?;
            storage.export(&run, &output, format)?;
            println!("Exported {} to {}", id, output.display());
        }
        cli::ResultsAction::Delete { id } => {
            if !storage.delete(&id)? {
                bail!("Run '{}' not found", id);
            }
            println!("Deleted run '{id}'");
        }
    }

    Ok(())
}

fn manage_config(config: AppConfig, explicit: Option<&Path>, args: cli::ConfigArgs) -> Result<()> {
    match args.action {
        cli::ConfigAction::Show => {
            match explicit.map(Path::to_path_buf).or_else(AppConfig::find) {
                Some(path) => println!("# {}", path.display()),
                None => println!("# defaults"),
            }
            print!("{}", serde_yaml::to_string(&config)?);

            let env = EnvConfig::load();
            if env.has_any() {
                println!();
                env.print_summary();
            }
        }
        cli::ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            AppConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
