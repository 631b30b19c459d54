//! Periodic tick source for the evaluation loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::job::Evaluation;
use crate::registry::PeerRegistry;
use crate::service::PeerJobs;

/// Runs [`PeerJobs::evaluate_all`] on a fixed period until shut down.
pub struct Scheduler {
    period: Duration,
}

impl Scheduler {
    /// A zero period is raised to one millisecond.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// The first pass runs immediately. A pass always completes before
    /// shutdown is observed. `on_tick` sees the results of every pass.
    /// Returns the number of passes run.
    pub async fn run<R, L, F>(
        &self,
        jobs: &mut PeerJobs<R, L>,
        mut shutdown: watch::Receiver<bool>,
        mut on_tick: F,
    ) -> usize
    where
        R: PeerRegistry,
        L: AuditLog,
        F: FnMut(&PeerJobs<R, L>, &[(String, Evaluation)]),
    {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0;

        info!(period_ms = self.period.as_millis() as u64, "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let results = jobs.evaluate_all();
                    ticks += 1;
                    on_tick(jobs, &results);
                }
            }
        }
        info!(ticks, "scheduler stopped");
        ticks
    }
}

/// A shutdown receiver that flips to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for ctrl-c");
                tx.closed().await;
            }
        }
    });
    rx
}
