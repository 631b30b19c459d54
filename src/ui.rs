//! Terminal output: a spinner while a pass runs and colored job listings.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use peer_jobs::{AuditEntry, Evaluation, Job, JobState};

/// Spinner shown while an evaluation pass runs.
pub struct TickProgress {
    /// Spinner cleared before the per-job lines are printed.
    pb: ProgressBar,
    /// Jobs whose action ran.
    green: Style,
    /// Jobs that errored.
    red: Style,
    /// Jobs that were skipped or will retry.
    yellow: Style,
}

impl TickProgress {
    /// Starts the spinner for a pass over `active` jobs.
    pub fn start(active: usize) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("Evaluating {active} active job(s)"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Clears the spinner and prints one line per job that did something.
    pub fn complete(&self, results: &[(String, Evaluation)]) {
        self.pb.finish_and_clear();
        let mut quiet = 0;
        for (job_id, evaluation) in results {
            match evaluation {
                Evaluation::Fired => {
                    println!("  {} {job_id} fired", self.green.apply_to("✓"));
                }
                Evaluation::ActionFailed(reason) => {
                    println!(
                        "  {} {job_id} action failed, will retry: {reason}",
                        self.yellow.apply_to("↻")
                    );
                }
                Evaluation::Errored(reason) => {
                    println!("  {} {job_id} errored: {reason}", self.red.apply_to("✗"));
                }
                Evaluation::Skipped(reason) => {
                    println!("  {} {job_id} skipped: {reason}", self.yellow.apply_to("-"));
                }
                Evaluation::ConditionFalse => quiet += 1,
            }
        }
        println!("{} job(s) evaluated, {quiet} waiting", results.len());
    }
}

/// One line per job: id, state, configuration/peer and the rule.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    let green = Style::new().green();
    let dim = Style::new().dim();
    for job in jobs {
        let state = match job.state() {
            JobState::Active => green.apply_to(job.state().to_string()),
            JobState::Expired => dim.apply_to(job.state().to_string()),
        };
        println!(
            "{} [{state}] {}/{} {}",
            Style::new().bold().apply_to(&job.job_id),
            job.configuration,
            job.peer,
            job.describe()
        );
    }
}

/// Audit entries, newest first as the log returns them.
pub fn print_logs(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No log entries.");
        return;
    }
    let green = Style::new().green();
    let red = Style::new().red();
    for entry in entries {
        let mark = if entry.success {
            green.apply_to("ok  ")
        } else {
            red.apply_to("fail")
        };
        println!(
            "{} {mark} {} {}",
            entry.log_date.format(peer_jobs::job::TIMESTAMP_FORMAT),
            entry.job_id,
            entry.message
        );
    }
}
