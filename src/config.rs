//! Settings loaded from `peer-jobs.toml`.
//!
//! Missing keys fall back to defaults. `PEER_JOBS_DATA_DIR` and
//! `PEER_JOBS_LOG` take precedence over the file.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "peer-jobs.toml";
pub const JOBS_DB_FILE: &str = "peer_jobs.db";
pub const LOGS_DB_FILE: &str = "peer_job_logs.db";

#[derive(Debug, Clone, Deserialize)]
pub struct PeerJobsConfig {
    /// Directory holding both databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between evaluation passes in daemon mode.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// `tracing` filter directive, e.g. `info` or `peer_jobs=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("db")
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PeerJobsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tick_interval_secs: default_tick_interval_secs(),
            log_level: default_log_level(),
        }
    }
}

impl PeerJobsConfig {
    /// Loads `path`, or `peer-jobs.toml` in the current directory when no
    /// path is given. Only an explicitly named file is required to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("PEER_JOBS_DATA_DIR")
            && !dir.is_empty()
        {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = var("PEER_JOBS_LOG")
            && !level.is_empty()
        {
            self.log_level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.data_dir.join(JOBS_DB_FILE)
    }

    pub fn logs_db_path(&self) -> PathBuf {
        self.data_dir.join(LOGS_DB_FILE)
    }
}
