use anyhow::{bail, Context, Result};
use bgproc_scheduler::{
    task_fn, ConfigFile, Priority, PrioritySystemInfo, ProcessId, ProcessRecord, ProcessRequest,
    ProcessScheduler, ProcessType, QueueStatus, SchedulerConfig, SchedulerStats, TaskError, TaskFn,
    TaskOutput, TaskRegistry, WorkerPool,
};
use bgproc_storage::{read_history, HistoryStore, Storage};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,bgproc=info";

/// Progress updates per simulated job
const SIMULATED_STEPS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "bgproc")]
#[command(about = "Background process scheduler")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run simulated processes on the worker pools and print a JSON report.
    Run {
        /// Job to submit, repeatable.
        #[arg(long = "job", value_name = "TYPE:PRIORITY[:MILLIS[:fail]]", required = true)]
        jobs: Vec<String>,
        #[arg(long)]
        admin_workers: Option<usize>,
        #[arg(long)]
        user_workers: Option<usize>,
        #[command(flatten)]
        config: ConfigArgs,
        /// Append terminal records to this JSON-lines file.
        #[arg(long, value_name = "FILE")]
        history: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print the effective scheduler configuration.
    Config {
        #[command(flatten)]
        config: ConfigArgs,
        /// Store the effective configuration in the data directory.
        #[arg(long)]
        save: bool,
    },
    /// Print recorded process history as a JSON array.
    History {
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// JSON configuration file; replaces stored settings.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Data directory holding scheduler.json and history.jsonl.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    queue_status: QueueStatus,
    system_info: PrioritySystemInfo,
    stats: SchedulerStats,
    processes: Vec<ProcessRecord>,
}

/// One `--job` argument
#[derive(Debug, Clone, PartialEq, Eq)]
struct JobSpec {
    process_type: ProcessType,
    priority: Priority,
    duration: Option<Duration>,
    fail: bool,
}

impl FromStr for JobSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            bail!("expected TYPE:PRIORITY[:MILLIS[:fail]], got {s:?}");
        }

        let process_type = parts[0].parse::<ProcessType>()?;
        let priority = parts[1].parse::<Priority>()?;
        let duration = match parts.get(2) {
            Some(ms) => Some(Duration::from_millis(
                ms.parse().with_context(|| format!("invalid duration {ms:?}"))?,
            )),
            None => None,
        };
        let fail = match parts.get(3) {
            Some(&"fail") => true,
            Some(other) => bail!("unknown job flag {other:?} (expected \"fail\")"),
            None => false,
        };

        Ok(Self { process_type, priority, duration, fail })
    }
}

/// Install the stderr log subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Run { jobs, admin_workers, user_workers, config, history, timeout_secs } => {
            let mut scheduler_config = resolve_config(&config)?;
            if let Some(n) = admin_workers {
                scheduler_config.admin_workers = n;
            }
            if let Some(n) = user_workers {
                scheduler_config.user_workers = n;
            }
            let history = history.or_else(|| {
                config.data_dir.as_ref().map(|dir| Storage::with_root(dir).history_path())
            });
            run_jobs(&jobs, scheduler_config, history.as_deref(), Duration::from_secs(timeout_secs))
        }
        Commands::Config { config, save } => run_config(&config, save),
        Commands::History { file, data_dir } => run_history(file, data_dir),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Defaults, then the data directory, then `--config`, then environment.
fn resolve_config(args: &ConfigArgs) -> Result<SchedulerConfig> {
    let mut config = match &args.data_dir {
        Some(dir) => Storage::with_root(dir)
            .load_config()
            .with_context(|| format!("failed to load stored config from {}", dir.display()))?,
        None => SchedulerConfig::default(),
    };

    if let Some(path) = &args.config {
        config = SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
    }

    config.apply_env().context("invalid environment override")
}

fn run_config(args: &ConfigArgs, save: bool) -> Result<()> {
    let config = resolve_config(args)?;
    config.validate().context("invalid configuration")?;

    if save {
        let storage = match &args.data_dir {
            Some(dir) => Storage::with_root(dir),
            None => Storage::from_default_project()?,
        };
        storage.save_config(&config).context("failed to save config")?;
        info!(root = %storage.root().display(), "configuration saved");
    }

    let json = serde_json::to_string_pretty(&ConfigFile::from(&config))?;
    println!("{json}");
    Ok(())
}

fn run_history(file: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<()> {
    let path = match (file, data_dir) {
        (Some(file), _) => file,
        (None, Some(dir)) => Storage::with_root(dir).history_path(),
        (None, None) => Storage::from_default_project()?.history_path(),
    };

    let records = read_history(&path)
        .with_context(|| format!("failed to read history from {}", path.display()))?;

    let json = serde_json::to_string_pretty(&records)?;
    println!("{json}");
    Ok(())
}

fn run_jobs(
    jobs: &[String],
    config: SchedulerConfig,
    history: Option<&Path>,
    timeout: Duration,
) -> Result<()> {
    let specs = jobs
        .iter()
        .map(|raw| raw.parse::<JobSpec>().with_context(|| format!("invalid --job {raw:?}")))
        .collect::<Result<Vec<_>>>()?;

    config.validate().context("invalid configuration")?;
    let mut scheduler = ProcessScheduler::new(config)?.with_registry(default_registry());
    if let Some(path) = history {
        let store = HistoryStore::open(path)
            .with_context(|| format!("failed to open history {}", path.display()))?;
        scheduler = scheduler.with_sink(store).context("failed to start history writer")?;
    }
    let scheduler = Arc::new(scheduler);
    let pool = WorkerPool::start(Arc::clone(&scheduler)).context("failed to start worker pools")?;

    let mut ids: Vec<ProcessId> = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let description = format!("{} job {}", spec.process_type, index + 1);
        let admitted = match (spec.duration, spec.fail, spec.priority) {
            (None, false, Priority::High) => {
                scheduler.trigger_system_task(spec.process_type, description)
            }
            (None, false, Priority::Normal) => scheduler
                .submit_registered(ProcessRequest::user(spec.process_type, description)),
            (duration, fail, priority) => scheduler.submit(
                ProcessRequest::new(spec.process_type, priority, description),
                simulated_task(duration.unwrap_or_else(|| default_duration(spec.process_type)), fail),
            ),
        };
        ids.push(admitted.with_context(|| format!("failed to submit {}", jobs[index]))?);
    }

    let finished = scheduler.wait_idle(timeout);
    if !finished {
        warn!(timeout_secs = timeout.as_secs(), "timed out, cancelling remaining processes");
        for record in scheduler.active_processes() {
            let _ = scheduler.cancel(record.process_id);
        }
    }
    pool.shutdown();
    scheduler.close();

    let report = RunReport {
        queue_status: scheduler.queue_status(),
        system_info: scheduler.priority_system_info(),
        stats: scheduler.stats(),
        processes: ids.iter().filter_map(|id| scheduler.get_process(*id)).collect(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    println!("{json}");

    if !finished {
        bail!("timed out after {}s waiting for processes", timeout.as_secs());
    }
    Ok(())
}

fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for process_type in ProcessType::ALL {
        let task = simulated_task(default_duration(process_type), false);
        registry.register(process_type, move |ctx| task(ctx));
    }
    registry
}

fn default_duration(process_type: ProcessType) -> Duration {
    match process_type {
        ProcessType::QuotaRefresh => Duration::from_millis(40),
        ProcessType::MassBackup => Duration::from_millis(120),
        ProcessType::Cleanup => Duration::from_millis(60),
        ProcessType::IntegrityCheck => Duration::from_millis(80),
    }
}

/// Stepwise sleep with a progress checkpoint after each step
fn simulated_task(duration: Duration, fail: bool) -> TaskFn {
    task_fn(move |ctx| {
        let step = duration / SIMULATED_STEPS;
        for i in 1..=SIMULATED_STEPS {
            thread::sleep(step);
            if fail && i == SIMULATED_STEPS / 2 {
                return Err(TaskError::failed(format!("simulated {} failure", ctx.process_type())));
            }
            ctx.report_progress(i as f32 * 100.0 / SIMULATED_STEPS as f32)?;
        }

        let elapsed_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Ok(TaskOutput::with_result(json!({ "simulated_ms": elapsed_ms }))
            .with_metadata(json!({ "steps": SIMULATED_STEPS })))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgproc_scheduler::TaskContext;

    #[test]
    fn job_spec_parses_all_forms() {
        let spec: JobSpec = "quota_refresh:high".parse().unwrap();
        assert_eq!(spec.process_type, ProcessType::QuotaRefresh);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.duration, None);
        assert!(!spec.fail);

        let spec: JobSpec = "mass_backup:normal:250:fail".parse().unwrap();
        assert_eq!(spec.process_type, ProcessType::MassBackup);
        assert_eq!(spec.priority, Priority::Normal);
        assert_eq!(spec.duration, Some(Duration::from_millis(250)));
        assert!(spec.fail);
    }

    #[test]
    fn job_spec_rejects_bad_input() {
        let err = "cleanup:urgent".parse::<JobSpec>().unwrap_err();
        assert!(err.to_string().contains("invalid priority"));

        let err = "defrag:high".parse::<JobSpec>().unwrap_err();
        assert!(err.to_string().contains("unknown process type"));

        assert!("cleanup".parse::<JobSpec>().is_err());
        assert!("cleanup:high:abc".parse::<JobSpec>().is_err());
        assert!("cleanup:high:10:explode".parse::<JobSpec>().is_err());
        assert!("cleanup:high:10:fail:extra".parse::<JobSpec>().is_err());
    }

    #[test]
    fn simulated_task_reports_progress() {
        let task = simulated_task(Duration::from_millis(10), false);
        let ctx = TaskContext::detached(ProcessType::Cleanup);

        let output = task(&ctx).unwrap();
        assert_eq!(ctx.progress(), 100.0);
        assert_eq!(output.result, Some(json!({ "simulated_ms": 10 })));
    }

    #[test]
    fn simulated_task_fails_halfway() {
        let task = simulated_task(Duration::from_millis(10), true);
        let ctx = TaskContext::detached(ProcessType::MassBackup);

        let err = task(&ctx).unwrap_err();
        assert_eq!(err, TaskError::failed("simulated mass_backup failure"));
        assert_eq!(ctx.progress(), 40.0);
    }

    #[test]
    fn simulated_task_stops_when_cancelled() {
        let task = simulated_task(Duration::from_millis(10), false);
        let ctx = TaskContext::detached(ProcessType::IntegrityCheck);
        ctx.token().cancel();

        assert_eq!(task(&ctx), Err(TaskError::Cancelled));
        assert_eq!(ctx.progress(), 0.0);
    }

    #[test]
    fn default_registry_covers_every_type() {
        let registry = default_registry();
        assert_eq!(registry.len(), ProcessType::ALL.len());
    }
}
