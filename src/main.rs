use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobhost::config::{AppConfig, CliConfig, FileConfig};
use jobhost::jobs::{
    CommandUnit, JobHandle, JobInfo, JobRegistry, JobState, OutputRecord, OutputStream,
    ReceiveMode, WorkerMode,
};
use jobhost::metrics;
use jobhost::triggers::create_scheduler;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "jobhost")]
#[command(version)]
#[command(about = "Run commands as supervised background jobs")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// How job workers are hosted.
    #[clap(long, global = true, default_value = "pooled")]
    pub worker_mode: WorkerMode,

    /// Seconds to wait for running jobs when shutting down.
    #[clap(long, global = true, default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Longest the trigger scheduler sleeps between checks.
    #[clap(long, global = true, default_value_t = 60)]
    pub max_tick_secs: u64,

    /// Seconds between sweeps that log and remove finished jobs.
    #[clap(long, global = true, default_value_t = 5)]
    pub reap_interval_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            worker_mode: self.worker_mode,
            shutdown_grace_secs: self.shutdown_grace_secs,
            max_tick_secs: self.max_tick_secs,
            reap_interval_secs: self.reap_interval_secs,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a single command as a job and print its output
    Exec {
        /// Stop the job if it has not finished after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print a JSON report instead of the raw output.
        #[arg(long)]
        json: bool,

        /// Program to run.
        program: String,

        /// Arguments passed to the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run the configured triggers until interrupted
    Serve,
}

#[derive(Serialize)]
struct OutputLine<'a> {
    stream: &'a str,
    text: &'a str,
    at: String,
}

impl<'a> From<&'a OutputRecord> for OutputLine<'a> {
    fn from(record: &'a OutputRecord) -> Self {
        Self {
            stream: record.stream.as_str(),
            text: &record.text,
            at: record.at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct ExecReport<'a> {
    job: JobInfo,
    output: Vec<OutputLine<'a>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    // Load TOML config if specified
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    metrics::init_metrics();

    let registry = JobRegistry::new(app_config.worker_mode);
    info!(
        "Job registry ready ({} workers)",
        app_config.worker_mode.as_str()
    );

    match cli_args.command {
        Commands::Exec {
            timeout_secs,
            json,
            program,
            args,
        } => {
            run_exec(
                registry,
                &app_config,
                timeout_secs.map(Duration::from_secs),
                json,
                program,
                args,
            )
            .await
        }
        Commands::Serve => run_serve(registry, app_config).await,
    }
}

async fn run_exec(
    registry: JobRegistry,
    app_config: &AppConfig,
    timeout: Option<Duration>,
    json: bool,
    program: String,
    args: Vec<String>,
) -> Result<()> {
    let job = registry.submit(CommandUnit::new(program, args)).await?;
    let id = job.id();

    match timeout {
        Some(timeout) => {
            let finished = registry.wait(&[id], timeout).await?;
            if !finished.contains(&id) {
                warn!("Job {} still running after {:?}, stopping it", id, timeout);
                if let Err(e) = registry.stop(id).await {
                    debug!("Stop request for job {} ignored: {}", id, e);
                }
                registry.wait(&[id], app_config.shutdown_grace).await?;
            }
        }
        None => job.wait_terminal().await,
    }

    let records = registry.receive(id, ReceiveMode::Drain).await?;
    if json {
        let report = ExecReport {
            job: job.info(),
            output: records.iter().map(OutputLine::from).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for record in &records {
            match record.stream {
                OutputStream::Error => eprintln!("{}", record.text),
                OutputStream::Output | OutputStream::Info => println!("{}", record.text),
            }
        }
    }

    registry.shutdown(app_config.shutdown_grace).await;

    match job.state() {
        JobState::Completed => Ok(()),
        state => bail!(
            "Job {} ended {}: {}",
            id,
            state,
            job.failure().unwrap_or_else(|| "no failure recorded".to_string())
        ),
    }
}

async fn run_serve(registry: JobRegistry, app_config: AppConfig) -> Result<()> {
    let shutdown_token = CancellationToken::new();
    let (mut scheduler, scheduler_handle) = create_scheduler(
        registry.clone(),
        shutdown_token.child_token(),
        app_config.scheduler.clone(),
    );

    for trigger in &app_config.triggers {
        scheduler_handle
            .register(trigger.definition())
            .await
            .with_context(|| format!("Failed to register trigger {}", trigger.id))?;
    }

    let reaper_registry = registry.clone();
    let reaper_token = shutdown_token.child_token();
    let reap_interval = app_config.reap_interval;
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => reap_jobs(&reaper_registry).await,
                _ = reaper_token.cancelled() => break,
            }
        }
    });

    info!(
        "Serving {} triggers, press Ctrl+C to stop",
        app_config.triggers.len()
    );

    tokio::select! {
        _ = scheduler.run() => {
            info!("Scheduler stopped");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
    }

    shutdown_token.cancel();
    if let Err(e) = reaper.await {
        error!("Job reaper task failed: {}", e);
    }
    registry.shutdown(app_config.shutdown_grace).await;
    // Flush whatever the stopped jobs left behind
    reap_jobs(&registry).await;

    debug!("Final metrics:\n{}", metrics::gather_text());
    Ok(())
}

/// Log buffered output of every job, then drop the ones that finished.
async fn reap_jobs(registry: &JobRegistry) {
    for job in registry.list().await {
        // Terminal jobs have a frozen buffer, so draining after this check
        // cannot miss records
        let finished = job.state().is_terminal();
        log_output(&job, job.output().read(ReceiveMode::Drain));
        if !finished {
            continue;
        }

        match job.failure() {
            Some(failure) => warn!("Job {} ({}) {}: {}", job.id(), job.name(), job.state(), failure),
            None => info!("Job {} ({}) {}", job.id(), job.name(), job.state()),
        }
        if let Err(e) = registry.remove(job.id()).await {
            error!("Failed to remove job {}: {}", job.id(), e);
        }
    }
}

fn log_output(job: &Arc<JobHandle>, records: Vec<OutputRecord>) {
    for record in records {
        match record.stream {
            OutputStream::Error => warn!("[job {} {}] {}", job.id(), job.name(), record.text),
            OutputStream::Output | OutputStream::Info => {
                info!("[job {} {}] {}", job.id(), job.name(), record.text)
            }
        }
    }
}
