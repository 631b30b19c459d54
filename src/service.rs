use std::io::BufRead;

use tracing::debug;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::Result;
use crate::job::{Job, JobDraft};
use crate::registry::PeerRegistry;
use crate::store::{JobStore, RestoreSummary};

/// Rule-management surface over a job store, an audit log and a peer registry.
///
/// All three collaborators are supplied at construction; the evaluation loop
/// (`run_job`) is implemented in the `runner` module.
pub struct PeerJobs<R, L> {
    pub(crate) store: JobStore,
    pub(crate) audit: L,
    pub(crate) registry: R,
}

impl<R: PeerRegistry, L: AuditLog> PeerJobs<R, L> {
    pub fn new(store: JobStore, audit: L, registry: R) -> Self {
        Self {
            store,
            audit,
            registry,
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn audit(&self) -> &L {
        &self.audit
    }

    /// Every job of a configuration, active or expired.
    pub fn get_all_jobs(&self, configuration: &str) -> Result<Vec<Job>> {
        self.store.list_by_configuration(configuration)
    }

    /// Active jobs.
    pub fn active_jobs(&self) -> &[Job] {
        self.store.list_active()
    }

    pub fn search_job(&self, configuration: &str, peer: &str) -> Vec<Job> {
        self.store.search(configuration, peer)
    }

    pub fn search_job_by_id(&self, job_id: &str) -> Option<&Job> {
        self.store.search_by_id(job_id)
    }

    /// Any job ever saved under `job_id`, expired ones included.
    pub fn find_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.find(job_id)
    }

    /// Creates or updates a job, then lets the peer refresh its job list.
    pub fn save_job(&mut self, draft: JobDraft) -> Result<Vec<Job>> {
        let configuration = draft.configuration.clone();
        let peer = draft.peer.clone();
        let saved = self.store.save(draft, &self.audit)?;
        self.refresh_peer(&configuration, &peer);
        Ok(saved)
    }

    /// Soft-deletes an active job.
    pub fn delete_job(&mut self, job_id: &str) -> Result<()> {
        let job = self.store.expire(job_id, &self.audit)?;
        self.refresh_peer(&job.configuration, &job.peer);
        Ok(())
    }

    pub fn update_job_configuration_name(&mut self, old: &str, new: &str) -> Result<usize> {
        self.store.rename_configuration(old, new)
    }

    /// Active jobs as JSON, keyed by column name.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.store.list_active())?)
    }

    /// Audit entries of every job (active or expired) of a configuration.
    pub fn peer_job_logs(&self, configuration: &str) -> Result<Vec<AuditEntry>> {
        let ids: Vec<String> = self
            .store
            .list_by_configuration(configuration)?
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        self.audit.entries(&ids)
    }

    pub fn dump(&self, configuration: &str) -> Result<Vec<String>> {
        self.store.dump(configuration)
    }

    pub fn write_dump(&self, configuration: &str, writer: impl std::io::Write) -> Result<usize> {
        self.store.write_dump(configuration, writer)
    }

    pub fn restore(&mut self, reader: impl BufRead, merge: bool) -> Result<RestoreSummary> {
        self.store.restore(reader, merge)
    }

    /// Hands the peer its current active jobs. A missing configuration or
    /// peer makes this a no-op; the store change is already committed.
    pub(crate) fn refresh_peer(&self, configuration: &str, peer_id: &str) {
        let Some(config) = self.registry.configuration(configuration) else {
            debug!(configuration, "skipping job refresh, configuration not found");
            return;
        };
        let Some(peer) = config.search_peer(peer_id) else {
            debug!(configuration, peer = peer_id, "skipping job refresh, peer not found");
            return;
        };
        peer.refresh_jobs(&self.store.search(configuration, peer_id));
    }
}
