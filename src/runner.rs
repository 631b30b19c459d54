//! The evaluation pass run on every scheduler tick.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::compare::{Operand, compare};
use crate::error::SkipReason;
use crate::job::{
    self, Evaluation, FieldKind, Job, JobAction, Lifecycle, TIMESTAMP_FORMAT, Transition,
};
use crate::registry::{
    ActionOutcome, Counter, Peer, PeerRegistry, UsageScope, WireguardConfiguration,
};
use crate::service::PeerJobs;

impl<R: PeerRegistry, L: AuditLog> PeerJobs<R, L> {
    /// Evaluates every active job once. Outcomes are observable through the
    /// audit log and the store.
    pub fn run_job(&mut self) {
        self.evaluate_all();
    }

    /// Same pass as [`PeerJobs::run_job`], returning each job's evaluation.
    ///
    /// Jobs whose action ran are expired only after the whole batch has been
    /// evaluated.
    pub fn evaluate_all(&mut self) -> Vec<(String, Evaluation)> {
        info!("Running scheduled jobs");
        if let Err(err) = self.store.reload() {
            error!(error = %err, "failed to load active jobs");
            return Vec::new();
        }

        let jobs = self.store.list_active().to_vec();
        let mut results = Vec::with_capacity(jobs.len());
        let mut fired = Vec::new();

        for job in &jobs {
            let evaluation = match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(job))) {
                Ok(evaluation) => evaluation,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(job_id = %job.job_id, %reason, "Error processing job");
                    self.record(&job.job_id, false, &format!("Error processing job: {reason}"));
                    Evaluation::Errored(reason)
                }
            };

            if Lifecycle::next(job.state(), &evaluation) == Transition::Expire {
                fired.push(job.job_id.clone());
            }
            results.push((job.job_id.clone(), evaluation));
        }

        for job_id in fired {
            if let Err(err) = self.delete_job(&job_id) {
                error!(%job_id, error = %err, "failed to expire finished job");
            }
        }

        results
    }

    fn evaluate(&self, job: &Job) -> Evaluation {
        let Some(config) = self.registry.configuration(&job.configuration) else {
            let message = format!("Can't find configuration {}", job.configuration);
            warn!(job_id = %job.job_id, "{message}");
            self.record(&job.job_id, false, &message);
            return Evaluation::Skipped(SkipReason::ConfigurationNotFound);
        };

        let Some(peer) = config.search_peer(&job.peer) else {
            let message = format!(
                "Can't find peer {} in configuration {}",
                job.peer,
                config.name()
            );
            warn!(job_id = %job.job_id, "{message}");
            self.record(&job.job_id, false, &message);
            return Evaluation::Skipped(SkipReason::PeerNotFound);
        };

        let (x, y) = match job.field_kind {
            FieldKind::Usage(direction) => {
                let usage = peer.counter(Counter::Live(direction))
                    + peer.counter(Counter::Carryover(direction));
                match job.value.trim().parse::<f64>() {
                    Ok(limit) => (Operand::Number(usage), Operand::Number(limit)),
                    Err(_) => {
                        error!(job_id = %job.job_id, value = %job.value, "Invalid numeric value");
                        self.record(
                            &job.job_id,
                            false,
                            &format!("Invalid numeric value: {}", job.value),
                        );
                        return Evaluation::Skipped(SkipReason::InvalidNumericValue);
                    }
                }
            }
            FieldKind::Timestamp => {
                match NaiveDateTime::parse_from_str(&job.value, TIMESTAMP_FORMAT) {
                    Ok(threshold) => {
                        (Operand::Timestamp(job::now()), Operand::Timestamp(threshold))
                    }
                    Err(_) => {
                        debug!(
                            job_id = %job.job_id,
                            value = %job.value,
                            "value is not a timestamp, skipping"
                        );
                        return Evaluation::Skipped(SkipReason::UnparseableTimestamp);
                    }
                }
            }
        };

        if !compare(&x, &y, job.operator) {
            return Evaluation::ConditionFalse;
        }

        match dispatch(config, peer, job.action) {
            ActionOutcome::Success => {
                let message = format!(
                    "Peer {} from {} is successfully {}.",
                    peer.id(),
                    config.name(),
                    job.action.past_tense()
                );
                info!(job_id = %job.job_id, "{message}");
                self.record(&job.job_id, true, &message);
                Evaluation::Fired
            }
            ActionOutcome::Failure(reason) => {
                let message = format!(
                    "Peer {} from {} failed to {}. Reason: {reason}",
                    peer.id(),
                    config.name(),
                    job.action
                );
                info!(job_id = %job.job_id, "{message}");
                self.record(&job.job_id, false, &message);
                Evaluation::ActionFailed(reason)
            }
        }
    }

    /// Audit failures must not change the outcome of a job that already acted.
    fn record(&self, job_id: &str, success: bool, message: &str) {
        if let Err(err) = self.audit.log(job_id, success, message) {
            warn!(job_id, error = %err, "failed to write audit entry");
        }
    }
}

fn dispatch(
    config: &dyn WireguardConfiguration,
    peer: &dyn Peer,
    action: JobAction,
) -> ActionOutcome {
    let ids = [peer.id()];
    match action {
        JobAction::Restrict => config.restrict_peers(&ids),
        JobAction::Delete => config.delete_peers(&ids),
        JobAction::ResetTotalDataUsage => {
            let reset = peer.reset_data_usage(UsageScope::Total);
            // The peer is bounced whether or not the reset went through; only
            // the reset decides the outcome.
            for (step, outcome) in [
                ("restrict", config.restrict_peers(&ids)),
                ("allow", config.allow_access_peers(&ids)),
            ] {
                if !outcome.is_success() {
                    warn!(peer = %peer.id(), step, ?outcome, "bounce after usage reset failed");
                }
            }
            if reset {
                ActionOutcome::Success
            } else {
                ActionOutcome::Failure("Data usage reset".into())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::audit::{AuditEntry, SqliteAuditLog};
    use crate::job::{JobDraft, JobState, Operator, TrafficDirection};
    use crate::store::JobStore;

    struct StubPeer {
        id: String,
        live_receive: f64,
        cumu_receive: f64,
        reset_ok: bool,
        resets: Cell<u32>,
    }

    impl Peer for StubPeer {
        fn id(&self) -> &str {
            &self.id
        }

        fn counter(&self, counter: Counter) -> f64 {
            match counter {
                Counter::Live(TrafficDirection::Receive) => self.live_receive,
                Counter::Carryover(TrafficDirection::Receive) => self.cumu_receive,
                _ => 0.0,
            }
        }

        fn reset_data_usage(&self, scope: UsageScope) -> bool {
            assert_eq!(scope, UsageScope::Total);
            self.resets.set(self.resets.get() + 1);
            self.reset_ok
        }
    }

    struct StubConfig {
        name: String,
        peer: StubPeer,
        fail_with: Option<String>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl StubConfig {
        fn act(&self, call: &'static str) -> ActionOutcome {
            if self.name == "boom" {
                panic!("registry exploded");
            }
            self.calls.borrow_mut().push(call);
            match &self.fail_with {
                Some(reason) => ActionOutcome::Failure(reason.clone()),
                None => ActionOutcome::Success,
            }
        }
    }

    impl WireguardConfiguration for StubConfig {
        fn name(&self) -> &str {
            &self.name
        }

        fn search_peer(&self, peer_id: &str) -> Option<&dyn Peer> {
            (self.peer.id == peer_id).then_some(&self.peer as &dyn Peer)
        }

        fn restrict_peers(&self, peer_ids: &[&str]) -> ActionOutcome {
            assert_eq!(peer_ids, [self.peer.id.as_str()]);
            self.act("restrict")
        }

        fn delete_peers(&self, _peer_ids: &[&str]) -> ActionOutcome {
            self.act("delete")
        }

        fn allow_access_peers(&self, _peer_ids: &[&str]) -> ActionOutcome {
            self.act("allow")
        }
    }

    struct StubRegistry {
        configs: Vec<StubConfig>,
    }

    impl PeerRegistry for StubRegistry {
        fn configuration(&self, name: &str) -> Option<&dyn WireguardConfiguration> {
            self.configs
                .iter()
                .find(|c| c.name == name)
                .map(|c| c as &dyn WireguardConfiguration)
        }
    }

    fn config(name: &str, live: f64, cumu: f64, fail_with: Option<&str>) -> StubConfig {
        StubConfig {
            name: name.into(),
            peer: StubPeer {
                id: "peer-a".into(),
                live_receive: live,
                cumu_receive: cumu,
                reset_ok: true,
                resets: Cell::new(0),
            },
            fail_with: fail_with.map(str::to_string),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn engine(configs: Vec<StubConfig>) -> PeerJobs<StubRegistry, SqliteAuditLog> {
        PeerJobs::new(
            JobStore::open_in_memory().unwrap(),
            SqliteAuditLog::open_in_memory().unwrap(),
            StubRegistry { configs },
        )
    }

    fn job(
        id: &str,
        configuration: &str,
        field: &str,
        operator: Operator,
        value: &str,
        action: JobAction,
    ) -> JobDraft {
        JobDraft {
            job_id: id.into(),
            configuration: configuration.into(),
            peer: "peer-a".into(),
            field: field.into(),
            operator,
            value: value.into(),
            action,
        }
    }

    fn calls(
        jobs: &PeerJobs<StubRegistry, SqliteAuditLog>,
        configuration: &str,
    ) -> Vec<&'static str> {
        jobs.registry()
            .configs
            .iter()
            .find(|c| c.name == configuration)
            .unwrap()
            .calls
            .borrow()
            .clone()
    }

    fn latest_log(jobs: &PeerJobs<StubRegistry, SqliteAuditLog>, job_id: &str) -> AuditEntry {
        jobs.audit().entries(&[job_id.to_string()]).unwrap().remove(0)
    }

    #[test]
    fn usage_over_limit_fires_action() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::Restrict,
        ))
        .unwrap();

        let results = jobs.evaluate_all();
        assert_eq!(results, vec![("j1".to_string(), Evaluation::Fired)]);
        assert_eq!(calls(&jobs, "wg0"), vec!["restrict"]);
        assert!(jobs.active_jobs().is_empty());

        let entries = jobs.audit().entries(&["j1".to_string()]).unwrap();
        assert_eq!(
            entries[0].message,
            "Job is removed due to being deleted or finished."
        );
        assert_eq!(entries[1].message, "Peer peer-a from wg0 is successfully restricted.");
        assert!(entries[1].success);
    }

    #[test]
    fn fired_job_is_never_evaluated_again() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::Restrict,
        ))
        .unwrap();

        jobs.run_job();
        jobs.run_job();
        assert_eq!(calls(&jobs, "wg0"), vec!["restrict"]);
        assert!(jobs.evaluate_all().is_empty());
        assert_eq!(
            jobs.get_all_jobs("wg0").unwrap()[0].state(),
            JobState::Expired
        );
    }

    #[test]
    fn usage_under_limit_does_nothing() {
        let mut jobs = engine(vec![config("wg0", 100.0, 50.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::Restrict,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![("j1".to_string(), Evaluation::ConditionFalse)]
        );
        assert!(calls(&jobs, "wg0").is_empty());
        assert_eq!(jobs.active_jobs().len(), 1);
    }

    #[test]
    fn invalid_numeric_value_is_logged_and_kept() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, None)]);
        jobs.save_job(job("j1", "wg0", "total_receive", Operator::Lgt, "abc", JobAction::Delete))
            .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![(
                "j1".to_string(),
                Evaluation::Skipped(SkipReason::InvalidNumericValue)
            )]
        );
        assert!(calls(&jobs, "wg0").is_empty());
        assert_eq!(jobs.active_jobs().len(), 1);

        let entry = latest_log(&jobs, "j1");
        assert_eq!(entry.message, "Invalid numeric value: abc");
        assert!(!entry.success);
    }

    #[test]
    fn past_timestamp_fires() {
        let mut jobs = engine(vec![config("wg0", 0.0, 0.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "date",
            Operator::Lgt,
            "2020-01-01 00:00:00",
            JobAction::Delete,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![("j1".to_string(), Evaluation::Fired)]
        );
        assert_eq!(calls(&jobs, "wg0"), vec!["delete"]);
        assert!(jobs.active_jobs().is_empty());
    }

    #[test]
    fn future_timestamp_waits() {
        let mut jobs = engine(vec![config("wg0", 0.0, 0.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "date",
            Operator::Lgt,
            "2999-01-01 00:00:00",
            JobAction::Delete,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![("j1".to_string(), Evaluation::ConditionFalse)]
        );
        assert_eq!(jobs.active_jobs().len(), 1);
    }

    #[test]
    fn unparseable_timestamp_is_a_silent_noop() {
        let mut jobs = engine(vec![config("wg0", 0.0, 0.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "allowed_ip",
            Operator::Eq,
            "10.0.0.2/32",
            JobAction::Restrict,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![(
                "j1".to_string(),
                Evaluation::Skipped(SkipReason::UnparseableTimestamp)
            )]
        );
        assert!(calls(&jobs, "wg0").is_empty());
        // Only the creation entry exists.
        assert_eq!(jobs.audit().entries(&["j1".to_string()]).unwrap().len(), 1);
    }

    #[test]
    fn missing_configuration_and_peer_are_logged() {
        let mut jobs = engine(vec![config("wg0", 0.0, 0.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg9",
            "date",
            Operator::Lgt,
            "2020-01-01 00:00:00",
            JobAction::Delete,
        ))
        .unwrap();
        let mut ghost = job(
            "j2",
            "wg0",
            "date",
            Operator::Lgt,
            "2020-01-01 00:00:00",
            JobAction::Delete,
        );
        ghost.peer = "ghost".into();
        jobs.save_job(ghost).unwrap();

        let results = jobs.evaluate_all();
        assert!(results.contains(&(
            "j1".to_string(),
            Evaluation::Skipped(SkipReason::ConfigurationNotFound)
        )));
        assert!(results.contains(&(
            "j2".to_string(),
            Evaluation::Skipped(SkipReason::PeerNotFound)
        )));
        assert_eq!(latest_log(&jobs, "j1").message, "Can't find configuration wg9");
        assert_eq!(
            latest_log(&jobs, "j2").message,
            "Can't find peer ghost in configuration wg0"
        );
        assert_eq!(jobs.active_jobs().len(), 2);
    }

    #[test]
    fn failed_action_is_retried_next_tick() {
        let mut jobs = engine(vec![config(
            "wg0",
            600_000.0,
            500_000.0,
            Some("peer is locked"),
        )]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::Restrict,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![(
                "j1".to_string(),
                Evaluation::ActionFailed("peer is locked".into())
            )]
        );
        jobs.run_job();

        assert_eq!(calls(&jobs, "wg0"), vec!["restrict", "restrict"]);
        assert_eq!(jobs.active_jobs().len(), 1);
        let entry = latest_log(&jobs, "j1");
        assert_eq!(
            entry.message,
            "Peer peer-a from wg0 failed to restrict. Reason: peer is locked"
        );
        assert!(!entry.success);
    }

    #[test]
    fn reset_usage_bounces_peer() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, None)]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::ResetTotalDataUsage,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![("j1".to_string(), Evaluation::Fired)]
        );
        assert_eq!(calls(&jobs, "wg0"), vec!["restrict", "allow"]);
        assert_eq!(jobs.registry().configs[0].peer.resets.get(), 1);
    }

    #[test]
    fn reset_reports_success_even_if_bounce_fails() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, Some("busy"))]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::ResetTotalDataUsage,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![("j1".to_string(), Evaluation::Fired)]
        );
        assert!(jobs.active_jobs().is_empty());
    }

    #[test]
    fn failed_reset_still_bounces_peer() {
        let mut stub = config("wg0", 600_000.0, 500_000.0, None);
        stub.peer.reset_ok = false;
        let mut jobs = engine(vec![stub]);
        jobs.save_job(job(
            "j1",
            "wg0",
            "total_receive",
            Operator::Lgt,
            "1000000",
            JobAction::ResetTotalDataUsage,
        ))
        .unwrap();

        assert_eq!(
            jobs.evaluate_all(),
            vec![(
                "j1".to_string(),
                Evaluation::ActionFailed("Data usage reset".into())
            )]
        );
        assert_eq!(calls(&jobs, "wg0"), vec!["restrict", "allow"]);
        assert_eq!(jobs.active_jobs().len(), 1);
        assert_eq!(
            latest_log(&jobs, "j1").message,
            "Peer peer-a from wg0 failed to reset_total_data_usage. Reason: Data usage reset"
        );
    }

    #[test]
    fn panicking_job_does_not_stop_the_batch() {
        let mut jobs = engine(vec![
            config("boom", 600_000.0, 500_000.0, None),
            config("wg0", 600_000.0, 500_000.0, None),
        ]);
        jobs.save_job(job("j1", "boom", "total_receive", Operator::Lgt, "1", JobAction::Restrict))
            .unwrap();
        jobs.save_job(job("j2", "wg0", "total_receive", Operator::Lgt, "1", JobAction::Restrict))
            .unwrap();

        let results = jobs.evaluate_all();
        assert!(results.contains(&(
            "j1".to_string(),
            Evaluation::Errored("registry exploded".into())
        )));
        assert!(results.contains(&("j2".to_string(), Evaluation::Fired)));
        assert_eq!(
            latest_log(&jobs, "j1").message,
            "Error processing job: registry exploded"
        );
        assert_eq!(jobs.active_jobs().len(), 1);
        assert_eq!(jobs.active_jobs()[0].job_id, "j1");
    }

    #[test]
    fn jobs_on_the_same_peer_all_fire_before_expiry() {
        let mut jobs = engine(vec![config("wg0", 600_000.0, 500_000.0, None)]);
        jobs.save_job(job("j1", "wg0", "total_receive", Operator::Lgt, "1", JobAction::Restrict))
            .unwrap();
        jobs.save_job(job(
            "j2",
            "wg0",
            "date",
            Operator::Lgt,
            "2020-01-01 00:00:00",
            JobAction::Delete,
        ))
        .unwrap();

        let results = jobs.evaluate_all();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, e)| *e == Evaluation::Fired));
        assert_eq!(calls(&jobs, "wg0").len(), 2);
        assert!(jobs.active_jobs().is_empty());
    }
}
