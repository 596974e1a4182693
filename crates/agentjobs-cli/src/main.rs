mod jobs;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use agentjobs_config::SchedulerConfig;
use agentjobs_scheduler::{JobScheduler, WorkerSettings};
use agentjobs_store::SqliteJobStore;

#[derive(Parser)]
#[command(name = "agentjobs", about = "Scheduled jobs for chat agents")]
struct Cli {
    /// Config file (defaults to ~/.agentjobs/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides config and AGENTJOBS_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Tenant to act on
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler worker until interrupted
    Worker {
        /// Process due jobs once and exit
        #[arg(long)]
        once: bool,
    },
    /// Manage agents
    Agent {
        #[command(subcommand)]
        command: jobs::AgentCommand,
    },
    /// Manage jobs
    Jobs {
        #[command(subcommand)]
        command: jobs::JobsCommand,
    },
    /// Show recent runs of a job
    Runs {
        job_id: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Close runs stuck in `running`
    Reap,
    /// Trim run history to the configured size
    Prune,
    /// Write the default config file
    Init,
    /// Check configuration and storage
    Health,
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = agentjobs_config::load_config_from(path)?;
            config.validate()?;
            config
        }
        None => agentjobs_config::load_config()?,
    };
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    Ok(config)
}

fn open_scheduler(config: &SchedulerConfig) -> anyhow::Result<JobScheduler<SqliteJobStore>> {
    if config.database_path.is_none() {
        agentjobs_config::ensure_config_dir()?;
    }
    let path = config.resolve_database_path()?;
    let store = SqliteJobStore::open(&path)?;
    tracing::debug!(path = %path.display(), "Opened job store");
    Ok(JobScheduler::with_defaults(
        Arc::new(store),
        config.defaults.clone(),
    ))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli)?;

    if let Commands::Init = cli.command {
        let path = match &cli.config {
            Some(path) => {
                agentjobs_config::save_config_to(&config, path)?;
                path.clone()
            }
            None => {
                agentjobs_config::save_config(&config)?;
                agentjobs_config::config_file_path()?
            }
        };
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let scheduler = open_scheduler(&config)?;
    let tenant = cli.tenant.as_str();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Worker { once } => {
            rt.block_on(worker::run_worker(scheduler, &config, once))?;
        }
        Commands::Agent { command } => {
            rt.block_on(jobs::run_agent(&scheduler, tenant, command))?;
        }
        Commands::Jobs { command } => {
            rt.block_on(jobs::run_jobs(&scheduler, tenant, command))?;
        }
        Commands::Runs { job_id, limit } => {
            let runs = rt.block_on(scheduler.list_runs(tenant, &job_id, limit))?;
            print_json(&runs)?;
        }
        Commands::Reap => {
            let stale_after = WorkerSettings::try_from(&config)?.stale_after;
            let reclaimed = rt.block_on(scheduler.cleanup_stale_runs(stale_after, Utc::now()))?;
            println!("Reclaimed {reclaimed} stale run(s)");
        }
        Commands::Prune => {
            let deleted = rt.block_on(scheduler.prune_all(config.retention.max_runs_per_job))?;
            println!("Deleted {deleted} run(s)");
        }
        Commands::Health => {
            let path = config.resolve_database_path()?;
            let active = rt.block_on(scheduler.list_jobs(
                tenant,
                &agentjobs_types::JobFilter {
                    status: Some(agentjobs_types::JobStatus::Active),
                    ..Default::default()
                },
            ))?;
            println!("agentjobs is healthy");
            println!("  database: {}", path.display());
            println!("  tenant: {tenant}");
            println!("  active jobs: {}", active.len());
            println!("  poll interval: {}s", config.worker.poll_interval_secs);
            println!("  concurrency: {}", config.worker.concurrency);
        }
        Commands::Init => {}
    }

    Ok(())
}
