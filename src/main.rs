mod cli;
mod config;
mod ui;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cli::{Cli, Command};
use config::{LOGS_DB_FILE, PeerJobsConfig};
use peer_jobs::scheduler::{Scheduler, shutdown_on_ctrl_c};
use peer_jobs::{JobDraft, JobError, JobStore, MemoryRegistry, PeerJobs, SqliteAuditLog};

type Engine = PeerJobs<MemoryRegistry, SqliteAuditLog>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PeerJobsConfig::load(cli.config.as_deref())?;
    init_tracing(&config, cli.verbose);

    let (jobs_db, logs_db) = database_paths(&config, cli.database.as_deref());

    match cli.command {
        Command::List { configuration } => {
            let jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            match configuration {
                Some(name) => ui::print_jobs(&jobs.get_all_jobs(&name)?),
                None => ui::print_jobs(jobs.active_jobs()),
            }
        }
        Command::Show { job_id } => {
            let jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            let job = jobs
                .find_job(&job_id)?
                .ok_or_else(|| JobError::JobNotFound(job_id.clone()))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Save {
            configuration,
            peer,
            field,
            operator,
            value,
            action,
            job_id,
        } => {
            let mut jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            let draft = JobDraft {
                job_id: job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                configuration,
                peer,
                field,
                operator,
                value,
                action,
            };
            let saved = jobs.save_job(draft)?;
            ui::print_jobs(&saved);
        }
        Command::Delete { job_id } => {
            let mut jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            jobs.delete_job(&job_id)?;
            println!("Deleted job {job_id}");
        }
        Command::RenameConfiguration { old, new } => {
            let mut jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            let changed = jobs.update_job_configuration_name(&old, &new)?;
            println!("Moved {changed} job(s) from {old} to {new}");
        }
        Command::Logs { configuration } => {
            let jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            ui::print_logs(&jobs.peer_job_logs(&configuration)?);
        }
        Command::Dump {
            configuration,
            output,
        } => {
            let jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            let written = match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    let mut writer = BufWriter::new(file);
                    let written = jobs.write_dump(&configuration, &mut writer)?;
                    writer.flush()?;
                    written
                }
                None => jobs.write_dump(&configuration, std::io::stdout().lock())?,
            };
            info!(%configuration, written, "dump complete");
        }
        Command::Restore { file, merge } => {
            let mut jobs = open(&jobs_db, &logs_db, MemoryRegistry::default())?;
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("opening {}", file.display()))?,
            );
            let summary = jobs.restore(reader, merge)?;
            println!(
                "Restored {} job(s), skipped {}",
                summary.inserted, summary.skipped
            );
        }
        Command::Tick { registry } => {
            let mut jobs = open(&jobs_db, &logs_db, load_registry(&registry)?)?;
            let progress = ui::TickProgress::start(jobs.active_jobs().len());
            let results = jobs.evaluate_all();
            progress.complete(&results);
            jobs.registry()
                .save(&registry)
                .with_context(|| format!("saving registry {}", registry.display()))?;
        }
        Command::Daemon { registry } => {
            let mut jobs = open(&jobs_db, &logs_db, load_registry(&registry)?)?;
            let scheduler = Scheduler::new(Duration::from_secs(config.tick_interval_secs));
            info!(period = ?scheduler.period(), "starting daemon");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                let shutdown = shutdown_on_ctrl_c();
                scheduler
                    .run(&mut jobs, shutdown, |jobs, _| {
                        if let Err(err) = jobs.registry().save(&registry) {
                            error!(error = %err, "failed to save registry snapshot");
                        }
                    })
                    .await
            });
        }
    }

    Ok(())
}

fn init_tracing(config: &PeerJobsConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// `--database` names the job database; the audit log sits beside it.
fn database_paths(config: &PeerJobsConfig, database: Option<&Path>) -> (PathBuf, PathBuf) {
    match database {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            (path.to_path_buf(), dir.join(LOGS_DB_FILE))
        }
        None => (config.jobs_db_path(), config.logs_db_path()),
    }
}

fn open(jobs_db: &Path, logs_db: &Path, registry: MemoryRegistry) -> Result<Engine> {
    for dir in [jobs_db.parent(), logs_db.parent()].into_iter().flatten() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data directory {}", dir.display()))?;
        }
    }
    let store = JobStore::open(jobs_db)
        .with_context(|| format!("opening job database {}", jobs_db.display()))?;
    let audit = SqliteAuditLog::open(logs_db)
        .with_context(|| format!("opening log database {}", logs_db.display()))?;
    Ok(PeerJobs::new(store, audit, registry))
}

fn load_registry(path: &Path) -> Result<MemoryRegistry> {
    MemoryRegistry::load(path).with_context(|| format!("loading registry {}", path.display()))
}
