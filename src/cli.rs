//! Command line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--database`, `--verbose`)
//! and one [`Command`] per management operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use peer_jobs::{JobAction, Operator};

/// Conditional-trigger jobs for WireGuard peers.
#[derive(Debug, Parser)]
#[command(name = "peer-jobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file to load instead of `./peer-jobs.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Job database to use instead of `<data_dir>/peer_jobs.db`. The audit
    /// log is kept next to it.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List active jobs.
    List {
        /// Show every job of this configuration, expired ones included.
        #[arg(long)]
        configuration: Option<String>,
    },

    /// Show one job, active or expired.
    Show { job_id: String },

    /// Create a job, or update the rule of an existing one.
    Save {
        #[arg(long)]
        configuration: String,

        #[arg(long)]
        peer: String,

        /// `total_receive`, `total_sent`, `total_data`, or a timestamp field.
        #[arg(long)]
        field: String,

        /// One of eq, neq, lgt, lst.
        #[arg(long)]
        operator: Operator,

        #[arg(long)]
        value: String,

        /// One of restrict, delete, reset_total_data_usage.
        #[arg(long)]
        action: JobAction,

        /// Id of the job to update. A new id is generated when omitted.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Soft-delete an active job.
    Delete { job_id: String },

    /// Move every job of a configuration to a new name.
    RenameConfiguration { old: String, new: String },

    /// Print the audit log of a configuration's jobs.
    Logs { configuration: String },

    /// Write a configuration's active jobs as SQL INSERT statements.
    Dump {
        configuration: String,

        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Replay a dump file into the job store.
    Restore {
        file: PathBuf,

        /// Keep jobs whose id already exists instead of failing.
        #[arg(long, default_value_t = false)]
        merge: bool,
    },

    /// Run one evaluation pass against a registry snapshot.
    Tick {
        /// JSON registry snapshot, rewritten after the pass.
        #[arg(long)]
        registry: PathBuf,
    },

    /// Evaluate jobs periodically until Ctrl-C.
    Daemon {
        /// JSON registry snapshot, rewritten after every pass.
        #[arg(long)]
        registry: PathBuf,
    },
}
