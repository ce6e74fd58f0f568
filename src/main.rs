mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bookforge::app::App;
use bookforge::jobs::worker::shutdown_signal;
use bookforge::jobs::{StartOutcome, WorkerManager};
use bookforge_av::ToolRegistry;
use bookforge_common::config::Config;
use bookforge_common::{ConversionKind, JobKey, JobStatus};
use bookforge_db::pool::get_conn;
use bookforge_db::queries::fanout;
use clap::Parser;
use cli::{Cli, Commands};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "bookforge=trace,bookforge_av=trace,bookforge_db=debug,bookforge_common=debug".to_string()
        } else {
            "bookforge=debug,bookforge_av=debug,bookforge_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Convert {
            input,
            activation_bytes,
            kind,
            output_dir,
        } => {
            let mut config = Config::load_or_default(config_path);
            if let Some(dir) = output_dir {
                config.conversion.output_dir = dir;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(convert(config, &input, &activation_bytes, kind.into()))
        }
        Commands::Status { subject, kind } => {
            let app = App::open(Config::load_or_default(config_path))?;
            let status = app.orchestrator.get_status(&JobKey::new(subject, kind.into()));
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::List => {
            let app = App::open(Config::load_or_default(config_path))?;
            let active = app.orchestrator.list_active()?;
            println!("{}", serde_json::to_string_pretty(&active)?);
            Ok(())
        }
        Commands::Worker => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_queue_workers(Config::load_or_default(config_path)))
        }
        Commands::Sweep => {
            let config = Config::load_or_default(config_path);
            let retention = config.retention.clone();
            let app = App::open(config)?;
            let report = app.orchestrator.recover(&retention)?;
            println!(
                "Reaped {} stale jobs, removed {} expired records and {} fan-out groups",
                report.reaped, report.swept.records, report.swept.fanout_groups
            );
            Ok(())
        }
        Commands::CheckTools => check_tools(&Config::load_or_default(config_path)),
        Commands::Validate { config } => {
            let path = config.or_else(|| cli.config.clone());
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("bookforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn convert(
    config: Config,
    input: &Path,
    activation_bytes: &str,
    kind: ConversionKind,
) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }

    let shutdown_timeout = config.workers.shutdown_timeout();
    let retention = config.retention.clone();
    let app = App::open(config).context("Failed to open job store")?;

    let recovery = app.orchestrator.recover(&retention)?;
    if recovery.reaped > 0 {
        tracing::info!(reaped = recovery.reaped, "Recovered jobs from a previous run");
    }

    let (key, outcome) = app.start_conversion(input, activation_bytes, kind)?;
    if outcome == StartOutcome::AlreadyActive {
        println!("Conversion already in progress for {key}; following it");
    }

    tokio::select! {
        result = follow_status(&app, &key) => result,
        _ = shutdown_signal() => {
            let report = app.orchestrator.shutdown(shutdown_timeout).await;
            if !report.finished_in_time {
                tracing::warn!(still_running = ?report.still_running, "Exiting with work in flight");
            }
            let status = app.orchestrator.get_status(&key);
            println!("{key}: {}", status.record.status);
            Ok(())
        }
    }
}

async fn follow_status(app: &App, key: &JobKey) -> Result<()> {
    let mut last_progress = -1.0;
    let mut last_status = JobStatus::NotStarted;

    loop {
        let status = app.orchestrator.get_status(key);
        let record = &status.record;

        if record.progress > last_progress || record.status != last_status {
            println!("{key}: {} {:>5.1}%", record.status, record.progress);
            last_progress = record.progress;
            last_status = record.status;
        }

        match record.status {
            JobStatus::Completed => {
                if let Some(ref path) = record.result_path {
                    println!("Output: {path}");
                }
                if let Some(ref url) = status.download_url {
                    println!("Download: {url}");
                }
                return Ok(());
            }
            JobStatus::Failed => {
                anyhow::bail!(
                    "Conversion failed: {}",
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            _ => {}
        }

        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    }
}

async fn run_queue_workers(config: Config) -> Result<()> {
    let shutdown_timeout = config.workers.shutdown_timeout();
    let retention = config.retention.clone();
    let app = App::open(config).context("Failed to open job store")?;
    app.orchestrator.recover(&retention)?;

    let manager = WorkerManager::new(app.config.queue.worker_concurrency);
    let workers = app.queue_workers(&manager.shutdown_token());
    if workers.is_empty() {
        anyhow::bail!("queue.worker_concurrency is 0; nothing to run");
    }

    let queued = {
        let conn = get_conn(app.store.pool())?;
        fanout::count_queued(&conn)?
    };
    tracing::info!(workers = workers.len(), queued, "Starting queue workers");
    for worker in workers {
        let name = worker.name().to_string();
        manager.run(name, move |_ctx| async move {
            worker.run().await;
            Ok(())
        })?;
    }

    shutdown_signal().await;
    let report = manager.request_shutdown(shutdown_timeout).await;
    if !report.finished_in_time {
        tracing::warn!(still_running = ?report.still_running, "Exiting with sub-tasks in flight");
    }
    Ok(())
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install ffmpeg to enable conversions.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read {}", p.display()))?;
            let config = Config::from_json(&contents)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Database: {}", config.database.path.display());
    println!("  Max concurrent jobs: {}", config.workers.max_concurrent_jobs);
    println!(
        "  Fan-out workers: {}",
        config.workers.effective_fanout_workers()
    );
    println!("  Queue mode: {:?}", config.queue.mode);
    println!("  Output dir: {}", config.conversion.output_dir.display());

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for w in &warnings {
            println!("  ! {w}");
        }
    }

    Ok(())
}
