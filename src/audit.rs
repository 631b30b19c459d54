//! Append-only audit log of job outcomes.
//!
//! Every store mutation and every evaluation outcome is recorded through the
//! [`AuditLog`] trait. [`SqliteAuditLog`] keeps the entries in a `JobLog`
//! table of its own database.

use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::job;

/// One recorded outcome for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditEntry {
    #[serde(rename = "LogID")]
    pub log_id: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub log_date: NaiveDateTime,
    #[serde(rename = "Status")]
    pub success: bool,
    pub message: String,
}

/// Sink for job outcomes.
pub trait AuditLog {
    fn log(&self, job_id: &str, success: bool, message: &str) -> Result<()>;

    /// Entries for the given jobs, newest first.
    fn entries(&self, job_ids: &[String]) -> Result<Vec<AuditEntry>>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS JobLog (
    LogID TEXT NOT NULL PRIMARY KEY,
    JobID TEXT NOT NULL,
    LogDate TEXT NOT NULL,
    Status INTEGER NOT NULL,
    Message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS JobLog_JobID ON JobLog (JobID);";

pub struct SqliteAuditLog {
    conn: Connection,
}

impl SqliteAuditLog {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened audit log");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

impl AuditLog for SqliteAuditLog {
    fn log(&self, job_id: &str, success: bool, message: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO JobLog (LogID, JobID, LogDate, Status, Message) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                job_id,
                job::now(),
                success,
                message
            ],
        )?;
        debug!(job_id, success, message, "audit entry recorded");
        Ok(())
    }

    fn entries(&self, job_ids: &[String]) -> Result<Vec<AuditEntry>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; job_ids.len()].join(", ");
        let sql = format!(
            "SELECT LogID, JobID, LogDate, Status, Message FROM JobLog \
             WHERE JobID IN ({placeholders}) ORDER BY LogDate DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(job_ids.iter()), |row| {
            Ok(AuditEntry {
                log_id: row.get(0)?,
                job_id: row.get(1)?,
                log_date: row.get(2)?,
                success: row.get(3)?,
                message: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
