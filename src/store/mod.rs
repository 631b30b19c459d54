//! Durable job table with an in-memory snapshot of the active jobs.
//!
//! Every mutation runs in its own transaction and is followed by a reload of
//! the snapshot, so a committed change is visible to the next
//! [`JobStore::list_active`].

mod dump;
mod schema;

pub use dump::RestoreSummary;

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use crate::audit::AuditLog;
use crate::error::{JobError, Result};
use crate::job::{self, Job, JobDraft};

pub struct JobStore {
    conn: Connection,
    jobs: Vec<Job>,
}

impl JobStore {
    /// Opens (or creates) the job database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::install_schema(&conn)?;
        let mut store = Self {
            conn,
            jobs: Vec::new(),
        };
        store.reload()?;
        debug!(active = store.jobs.len(), "Opened job store");
        Ok(store)
    }

    /// Re-reads the active jobs from storage.
    pub fn reload(&mut self) -> Result<()> {
        self.jobs = schema::select_jobs(
            &self.conn,
            "WHERE ExpireDate IS NULL ORDER BY CreationDate, rowid",
            [],
        )?;
        Ok(())
    }

    /// Active jobs as of the last reload.
    pub fn list_active(&self) -> &[Job] {
        &self.jobs
    }

    /// Every job of a configuration, active or expired.
    pub fn list_by_configuration(&self, configuration: &str) -> Result<Vec<Job>> {
        Ok(schema::select_jobs(
            &self.conn,
            "WHERE Configuration = ?1 ORDER BY CreationDate, JobID",
            params![configuration],
        )?)
    }

    /// Active jobs of one peer.
    pub fn search(&self, configuration: &str, peer: &str) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|j| j.configuration == configuration && j.peer == peer)
            .cloned()
            .collect()
    }

    pub fn search_by_id(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    /// Looks a job up in storage regardless of its state.
    pub fn find(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(schema::select_job(&self.conn, job_id)?)
    }

    /// Inserts the draft if its id is unseen, otherwise updates the rule of
    /// the existing active job in place.
    ///
    /// Returns the active jobs matching the draft's configuration, peer and id.
    #[instrument(skip_all, fields(job_id = %draft.job_id))]
    pub fn save(&mut self, draft: JobDraft, audit: &dyn AuditLog) -> Result<Vec<Job>> {
        let tx = self.conn.transaction()?;

        match schema::select_job(&tx, &draft.job_id)? {
            None => {
                let job = Job::from_draft(draft.clone(), job::now());
                schema::insert_job(&tx, &job)?;
                audit.log(
                    &job.job_id,
                    true,
                    &format!("Job is created {}", job.describe()),
                )?;
                info!(configuration = %job.configuration, peer = %job.peer, "job created");
            }
            Some(current) if !current.is_active() => {
                return Err(JobError::JobExpired(current.job_id));
            }
            Some(current) => {
                if current.configuration != draft.configuration {
                    return Err(JobError::ImmutableField {
                        job_id: current.job_id,
                        field: "Configuration",
                    });
                }
                if current.peer != draft.peer {
                    return Err(JobError::ImmutableField {
                        job_id: current.job_id,
                        field: "Peer",
                    });
                }
                tx.execute(
                    "UPDATE PeerJobs \
                     SET Field = ?1, FieldKind = ?2, Operator = ?3, Value = ?4, Action = ?5 \
                     WHERE JobID = ?6",
                    params![
                        draft.field,
                        draft.field_kind().as_str(),
                        draft.operator.as_str(),
                        draft.value,
                        draft.action.as_str(),
                        draft.job_id,
                    ],
                )?;
                audit.log(
                    &draft.job_id,
                    true,
                    &format!(
                        "Job is updated from {}; to {}",
                        current.describe(),
                        draft.describe()
                    ),
                )?;
                info!(configuration = %draft.configuration, peer = %draft.peer, "job updated");
            }
        }

        tx.commit()?;
        self.reload()?;

        Ok(self
            .jobs
            .iter()
            .filter(|j| {
                j.configuration == draft.configuration
                    && j.peer == draft.peer
                    && j.job_id == draft.job_id
            })
            .cloned()
            .collect())
    }

    /// Soft-deletes an active job by stamping its `ExpireDate`.
    ///
    /// The row is never removed. Returns the job as it was before expiry.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub fn expire(&mut self, job_id: &str, audit: &dyn AuditLog) -> Result<Job> {
        let tx = self.conn.transaction()?;

        let current = match schema::select_job(&tx, job_id)? {
            Some(job) if job.is_active() => job,
            _ => return Err(JobError::JobNotFound(job_id.to_string())),
        };

        let expire_date = job::now().max(current.creation_date);
        tx.execute(
            "UPDATE PeerJobs SET ExpireDate = ?1 WHERE JobID = ?2 AND ExpireDate IS NULL",
            params![expire_date, job_id],
        )?;
        audit.log(
            job_id,
            true,
            "Job is removed due to being deleted or finished.",
        )?;

        tx.commit()?;
        self.reload()?;
        info!(configuration = %current.configuration, peer = %current.peer, "job expired");
        Ok(current)
    }

    /// Moves every job of configuration `old` to `new`. Returns the number of
    /// rows changed.
    #[instrument(skip(self))]
    pub fn rename_configuration(&mut self, old: &str, new: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE PeerJobs SET Configuration = ?1 WHERE Configuration = ?2",
            params![new, old],
        )?;
        tx.commit()?;
        self.reload()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SqliteAuditLog;
    use crate::job::{FieldKind, JobAction, JobState, Operator, TrafficDirection};

    fn draft(id: &str, value: &str) -> JobDraft {
        JobDraft {
            job_id: id.into(),
            configuration: "wg0".into(),
            peer: "peer-a".into(),
            field: "total_receive".into(),
            operator: Operator::Lgt,
            value: value.into(),
            action: JobAction::Restrict,
        }
    }

    fn setup() -> (JobStore, SqliteAuditLog) {
        (
            JobStore::open_in_memory().unwrap(),
            SqliteAuditLog::open_in_memory().unwrap(),
        )
    }

    #[test]
    fn save_inserts_new_job() {
        let (mut store, audit) = setup();
        let saved = store.save(draft("j1", "100"), &audit).unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].job_id, "j1");
        assert_eq!(
            saved[0].field_kind,
            FieldKind::Usage(TrafficDirection::Receive)
        );
        assert_eq!(store.list_active().len(), 1);

        let logs = audit.entries(&["j1".to_string()]).unwrap();
        assert_eq!(
            logs[0].message,
            "Job is created if total_receive lgt 100 then restrict"
        );
    }

    #[test]
    fn second_save_updates_in_place() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();
        let created = store.search_by_id("j1").unwrap().creation_date;

        let mut changed = draft("j1", "200");
        changed.action = JobAction::Delete;
        let saved = store.save(changed, &audit).unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].value, "200");
        assert_eq!(saved[0].action, JobAction::Delete);
        assert_eq!(saved[0].creation_date, created);
        assert_eq!(store.list_by_configuration("wg0").unwrap().len(), 1);

        let logs = audit.entries(&["j1".to_string()]).unwrap();
        assert_eq!(
            logs[0].message,
            "Job is updated from if total_receive lgt 100 then restrict; to if total_receive lgt 200 then delete"
        );
    }

    #[test]
    fn update_recomputes_field_kind() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();

        let mut changed = draft("j1", "2030-01-01 00:00:00");
        changed.field = "date".into();
        let saved = store.save(changed, &audit).unwrap();
        assert_eq!(saved[0].field_kind, FieldKind::Timestamp);
    }

    #[test]
    fn configuration_and_peer_are_immutable() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();

        let mut moved = draft("j1", "100");
        moved.peer = "peer-b".into();
        let err = store.save(moved, &audit).unwrap_err();
        assert!(matches!(err, JobError::ImmutableField { field: "Peer", .. }));
        assert_eq!(store.search_by_id("j1").unwrap().peer, "peer-a");
    }

    #[test]
    fn expire_is_a_soft_delete() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();

        store.expire("j1", &audit).unwrap();
        assert!(store.list_active().is_empty());

        let row = store.find("j1").unwrap().unwrap();
        assert_eq!(row.state(), JobState::Expired);
        assert!(row.expire_date.unwrap() >= row.creation_date);
    }

    #[test]
    fn expire_unknown_job_fails() {
        let (mut store, audit) = setup();
        let err = store.expire("nope", &audit).unwrap_err();
        assert!(matches!(err, JobError::JobNotFound(_)));
    }

    #[test]
    fn expired_job_is_never_reactivated() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();
        store.expire("j1", &audit).unwrap();

        let err = store.save(draft("j1", "300"), &audit).unwrap_err();
        assert!(matches!(err, JobError::JobExpired(_)));
        assert!(matches!(
            store.expire("j1", &audit),
            Err(JobError::JobNotFound(_))
        ));
        assert!(store.list_active().is_empty());
    }

    #[test]
    fn list_by_configuration_includes_expired() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();
        store.save(draft("j2", "100"), &audit).unwrap();
        store.expire("j1", &audit).unwrap();

        assert_eq!(store.list_by_configuration("wg0").unwrap().len(), 2);
        assert_eq!(store.list_active().len(), 1);
        assert!(store.list_by_configuration("wg9").unwrap().is_empty());
    }

    #[test]
    fn rename_configuration_moves_all_jobs() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();
        store.save(draft("j2", "100"), &audit).unwrap();

        let changed = store.rename_configuration("wg0", "office").unwrap();
        assert_eq!(changed, 2);
        assert_eq!(store.search("office", "peer-a").len(), 2);
        assert!(store.search("wg0", "peer-a").is_empty());
    }

    #[test]
    fn search_filters_active_snapshot() {
        let (mut store, audit) = setup();
        store.save(draft("j1", "100"), &audit).unwrap();
        let mut other = draft("j2", "100");
        other.peer = "peer-b".into();
        store.save(other, &audit).unwrap();

        assert_eq!(store.search("wg0", "peer-a").len(), 1);
        assert_eq!(store.search("wg0", "peer-b").len(), 1);
        assert!(store.search_by_id("j2").is_some());
        assert!(store.search_by_id("j3").is_none());
    }
}
