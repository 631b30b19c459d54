use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SkipReason;

/// The two states of a job.
///
/// A job is created `Active` and ends `Expired`; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Active,
    Expired,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Active => write!(f, "ACTIVE"),
            JobState::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Outcome of evaluating one job during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The job could not be evaluated this tick.
    Skipped(SkipReason),
    /// The condition did not hold.
    ConditionFalse,
    /// The condition held and the action succeeded.
    Fired,
    /// The condition held but the action failed.
    ActionFailed(String),
    /// Evaluating the job panicked inside the registry.
    Errored(String),
}

/// What a tick does to a job after evaluating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing happened; evaluate again next tick.
    Stay,
    /// The action failed; retry it next tick.
    Retry,
    /// The action ran; expire the job once the batch is done.
    Expire,
}

/// Drives a job through its lifecycle.
pub struct Lifecycle;

impl Lifecycle {
    /// Compute the transition for a job in `state` given its evaluation.
    ///
    /// - `Expired` is terminal and always returns `Stay`.
    /// - In `Active`, only a fired action expires the job; a failed action
    ///   is retried and everything else leaves the job untouched.
    pub fn next(state: JobState, evaluation: &Evaluation) -> Transition {
        match state {
            JobState::Expired => Transition::Stay,
            JobState::Active => match evaluation {
                Evaluation::Fired => Transition::Expire,
                Evaluation::ActionFailed(_) => Transition::Retry,
                Evaluation::Skipped(_) | Evaluation::ConditionFalse | Evaluation::Errored(_) => {
                    Transition::Stay
                }
            },
        }
    }
}
