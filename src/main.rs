use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use benchctl::config::{load_inventory, OrchestratorConfig};
use benchctl::job::{JobManager, JobStatus, Mode, Workload};
use benchctl::persist::JsonFilePersistence;

#[derive(Parser, Debug)]
#[command(name = "benchctl")]
#[command(version)]
#[command(about = "Job orchestration for remote single-tenant lab devices")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a job on a device from an extracted workload directory
    Run(RunArgs),

    /// List the devices in an inventory file
    Inventory {
        /// Path to the device inventory (JSON array of devices)
        #[arg(long, short = 'i')]
        inventory: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the device inventory (JSON array of devices)
    #[arg(long, short = 'i')]
    inventory: PathBuf,

    /// Target device id
    #[arg(long, short = 'd')]
    device: String,

    /// Unique job id
    #[arg(long, short = 'j')]
    job: String,

    /// Extracted workload directory. An instruction.json inside makes the
    /// job manual; without one, step payloads are read from stdin, one
    /// JSON object per line.
    #[arg(long, short = 'w')]
    workload: PathBuf,

    /// Directory holding SSH private keys
    #[arg(long, default_value = "/data/access")]
    access_dir: PathBuf,

    /// Directory for job state snapshots
    #[arg(long, default_value = "/data/state")]
    state_dir: PathBuf,

    /// Milliseconds between device status polls
    #[arg(long, default_value = "1500")]
    poll_interval_ms: u64,

    /// Seconds to wait for the device agent to come up
    #[arg(long, default_value = "180")]
    startup_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run) => run_job(run).await,
        Commands::Inventory { inventory } => {
            let devices = load_inventory(&inventory)?;
            let mut sorted: Vec<_> = devices.values().collect();
            sorted.sort_by(|a, b| a.id.cmp(&b.id));
            for d in sorted {
                println!("{:<16} {}@{}:{}", d.id, d.user, d.host, d.port);
            }
            Ok(())
        }
    }
}

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let devices = load_inventory(&args.inventory)?;
    let workload = Workload::from_dir(&args.workload)?;
    let mode = workload.mode();

    let config = OrchestratorConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        startup_timeout: Duration::from_secs(args.startup_timeout_secs),
        access_dir: args.access_dir,
        ..Default::default()
    };
    let hooks = Arc::new(JsonFilePersistence::new(
        args.state_dir,
        args.workload.parent().map(|p| p.to_path_buf()),
    ));
    let manager = Arc::new(JobManager::new(config, devices, hooks));

    println!("submitting {} job {} on {}", mode, args.job, args.device);
    let state = manager
        .submit_job(&args.job, &args.device, workload)
        .await?;
    println!("job {}: {}", state.job_id, state.status);

    let outcome = match mode {
        Mode::Manual => tail_until_terminal(&manager, &args.job).await,
        Mode::Auto => drive_from_stdin(&manager, &args.job).await,
    };

    if outcome == JobStatus::Completed || (mode == Mode::Auto && outcome == JobStatus::Aborted) {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

/// Follow a manual job's state until it reaches a terminal status.
async fn tail_until_terminal(manager: &Arc<JobManager>, job_id: &str) -> JobStatus {
    let mut last = String::new();
    loop {
        let Ok(state) = manager.get_state(job_id).await else {
            return JobStatus::Failed;
        };
        let line = format!(
            "{} step={} {}",
            state.status,
            state.current_step.unwrap_or(0),
            state.message.as_deref().unwrap_or("")
        );
        if line != last {
            println!("{line}");
            last = line;
        }
        if state.status.is_terminal() {
            return state.status;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Feed an auto job from stdin: one JSON payload per line. The job is
/// aborted on end of input, which is the auto-mode shutdown path.
async fn drive_from_stdin(manager: &Arc<JobManager>, job_id: &str) -> JobStatus {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let payload: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("skipping unparsable payload: {e}");
                continue;
            }
        };
        match manager.step_and_wait(job_id, &payload).await {
            Ok(state) => println!(
                "step {} done, {}",
                state.current_step.unwrap_or(0),
                state.status
            ),
            Err(e) => {
                eprintln!("step failed: {e}");
                return manager
                    .get_state(job_id)
                    .await
                    .map(|s| s.status)
                    .unwrap_or(JobStatus::Failed);
            }
        }
    }

    manager.abort_job(job_id).await;
    manager
        .get_state(job_id)
        .await
        .map(|s| s.status)
        .unwrap_or(JobStatus::Aborted)
}
