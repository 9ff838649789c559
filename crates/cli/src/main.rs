//! CLI entry point for the transcode scheduler
//!
//! Loads configuration, probes the given inputs into the queue and runs the
//! scheduler until the queue drains or Ctrl-C is pressed.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use transcode_scheduler::{
    collect_inputs, enqueue_file, Config, EventLog, FfmpegEncoder, FfprobeProber, JobQueue,
    ResourceMonitor, Scheduler, SchedulerSettings, StopHandle, TracingEventLog,
};

/// Config file read when --config is not given, if present
const DEFAULT_CONFIG: &str = "config.toml";

/// Transcode Scheduler - encode media files while the host has headroom
#[derive(Parser, Debug)]
#[command(name = "transcode-scheduler")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory (overrides config and NAS_PATH)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for the run log file
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long, default_value = "false")]
    no_log_file: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long, default_value = "false")]
    json: bool,

    /// Media files or directories to transcode
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e)),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Config::load(DEFAULT_CONFIG).map_err(|e| format!("{}: {}", DEFAULT_CONFIG, e))
        }
        None => Config::from_env().map_err(|e| e.to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(output) = &args.output {
        config.output.base_path = output.clone();
    }
    if let Some(log_dir) = &args.log_dir {
        config.logging.log_dir = log_dir.clone();
    }
    if args.no_log_file {
        config.logging.log_to_file = false;
    }

    let log = match TracingEventLog::new(&config.logging) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let dispatch = log.dispatch().clone();
    let code = run(args, config, log.clone()).with_subscriber(dispatch).await;

    match Arc::try_unwrap(log) {
        Ok(log) => {
            if let Err(e) = log.close() {
                eprintln!("{}", e);
            }
        }
        Err(_) => eprintln!("Event log still in use at shutdown; flushing on drop"),
    }

    code
}

/// Stop the scheduler on the first Ctrl-C.
fn stop_on_ctrl_c(stop: StopHandle, log: Arc<dyn EventLog>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log.warning("Stop requested, finishing the current job...");
            stop.stop();
        }
    })
}

/// Abort the Ctrl-C watcher and wait until it has dropped its log handle.
async fn release_signal_task(task: JoinHandle<()>) {
    task.abort();
    let _ = task.await;
}

async fn run(args: Args, config: Config, log: Arc<TracingEventLog>) -> ExitCode {
    if let Some(path) = log.file_path() {
        tracing::debug!(log_file = %path.display(), "logging to file");
    }
    log.info(&format!(
        "Output directory: {}",
        config.output.base_path.display()
    ));

    let (files, missing) = collect_inputs(&args.inputs);
    for path in &missing {
        log.warning(&format!("Input not found: {}", path.display()));
    }

    let queue = Arc::new(JobQueue::new());
    let prober = FfprobeProber::new();
    let mut rejected = 0usize;
    for path in &files {
        match enqueue_file(&prober, &queue, path).await {
            Ok(id) => tracing::debug!(job_id = %id, path = %path.display(), "queued"),
            Err(e) => {
                rejected += 1;
                log.error(&format!("Skipping {}: {}", path.display(), e));
            }
        }
    }

    if queue.is_empty() {
        log.warning("Nothing to transcode.");
        return if rejected > 0 || !missing.is_empty() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }
    log.info(&format!("Queued {} file(s)", queue.len()));

    let encoder = Arc::new(FfmpegEncoder::new(
        config.output.base_path.clone(),
        config.encoder.clone(),
    ));
    let event_log: Arc<dyn EventLog> = log.clone();
    let mut scheduler = Scheduler::new(
        queue,
        ResourceMonitor::system(),
        encoder,
        event_log,
        SchedulerSettings::from(&config),
    );

    let signal_task = stop_on_ctrl_c(scheduler.stop_handle(), log.clone());
    let result = scheduler.run().await;
    drop(scheduler);
    release_signal_task(signal_task).await;

    match result {
        Ok(report) => {
            log.info(&format!(
                "Run finished: {} succeeded, {} failed, {} retried, {} blocked checks",
                report.succeeded, report.failed, report.retried, report.blocked_cycles
            ));
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log.error(&format!("Failed to serialize report: {}", e)),
                }
            }
            if report.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            log.error(&format!("Scheduler error: {}", e));
            ExitCode::FAILURE
        }
    }
}
