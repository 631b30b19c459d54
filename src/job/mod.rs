mod model;
mod state;

pub use model::{
    FieldKind, Job, JobAction, JobDraft, Operator, TIMESTAMP_FORMAT, TrafficDirection, now,
};
pub use state::{Evaluation, JobState, Lifecycle, Transition};
