use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};

use super::state::JobState;
use crate::error::JobError;

/// Fixed pattern a timestamp-kind job value must follow.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local wall-clock time, truncated to the precision the store keeps.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(6)
}

/// Comparison operator of a job rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    /// Strictly greater than.
    Lgt,
    /// Strictly less than.
    Lst,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Lgt => "lgt",
            Operator::Lst => "lst",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Operator::Eq),
            "neq" => Ok(Operator::Neq),
            "lgt" => Ok(Operator::Lgt),
            "lst" => Ok(Operator::Lst),
            other => Err(JobError::InvalidOperator(other.to_string())),
        }
    }
}

/// What happens to the peer once a job's condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Restrict,
    Delete,
    ResetTotalDataUsage,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Restrict => "restrict",
            JobAction::Delete => "delete",
            JobAction::ResetTotalDataUsage => "reset_total_data_usage",
        }
    }

    /// Past-tense form used in audit messages.
    pub fn past_tense(&self) -> &'static str {
        match self {
            JobAction::Restrict => "restricted",
            JobAction::Delete => "deleted",
            JobAction::ResetTotalDataUsage => "reset",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restrict" => Ok(JobAction::Restrict),
            "delete" => Ok(JobAction::Delete),
            "reset_total_data_usage" => Ok(JobAction::ResetTotalDataUsage),
            other => Err(JobError::InvalidAction(other.to_string())),
        }
    }
}

/// Traffic direction of a usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    Receive,
    Sent,
    Data,
}

impl TrafficDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficDirection::Receive => "receive",
            TrafficDirection::Sent => "sent",
            TrafficDirection::Data => "data",
        }
    }
}

/// How a job's `Field` is evaluated. Resolved once when the job is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Live plus carryover counter for one direction, compared as a number.
    Usage(TrafficDirection),
    /// Current time compared against a `YYYY-MM-DD HH:MM:SS` threshold.
    Timestamp,
}

impl FieldKind {
    pub fn resolve(field: &str) -> Self {
        match field {
            "total_receive" => FieldKind::Usage(TrafficDirection::Receive),
            "total_sent" => FieldKind::Usage(TrafficDirection::Sent),
            "total_data" => FieldKind::Usage(TrafficDirection::Data),
            _ => FieldKind::Timestamp,
        }
    }

    /// Column representation, e.g. `usage_receive` or `timestamp`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Usage(TrafficDirection::Receive) => "usage_receive",
            FieldKind::Usage(TrafficDirection::Sent) => "usage_sent",
            FieldKind::Usage(TrafficDirection::Data) => "usage_data",
            FieldKind::Timestamp => "timestamp",
        }
    }

    /// Parses a stored kind, falling back to resolving it from the field name
    /// for rows written without one.
    pub fn from_column(stored: Option<&str>, field: &str) -> Self {
        match stored {
            Some("usage_receive") => FieldKind::Usage(TrafficDirection::Receive),
            Some("usage_sent") => FieldKind::Usage(TrafficDirection::Sent),
            Some("usage_data") => FieldKind::Usage(TrafficDirection::Data),
            Some("timestamp") => FieldKind::Timestamp,
            _ => FieldKind::resolve(field),
        }
    }
}

/// A rule as submitted by a caller, before the store stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobDraft {
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub configuration: String,
    pub peer: String,
    pub field: String,
    pub operator: Operator,
    pub value: String,
    pub action: JobAction,
}

impl JobDraft {
    pub fn field_kind(&self) -> FieldKind {
        FieldKind::resolve(&self.field)
    }

    pub fn describe(&self) -> String {
        describe_rule(&self.field, self.operator, &self.value, self.action)
    }
}

/// A persisted rule: "if `field` `operator` `value` then `action`" for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub configuration: String,
    pub peer: String,
    pub field: String,
    pub field_kind: FieldKind,
    pub operator: Operator,
    pub value: String,
    pub creation_date: NaiveDateTime,
    pub expire_date: Option<NaiveDateTime>,
    pub action: JobAction,
}

impl Job {
    /// Stamps a draft as a freshly created, active job.
    pub fn from_draft(draft: JobDraft, creation_date: NaiveDateTime) -> Self {
        Self {
            field_kind: draft.field_kind(),
            job_id: draft.job_id,
            configuration: draft.configuration,
            peer: draft.peer,
            field: draft.field,
            operator: draft.operator,
            value: draft.value,
            creation_date,
            expire_date: None,
            action: draft.action,
        }
    }

    pub fn state(&self) -> JobState {
        match self.expire_date {
            None => JobState::Active,
            Some(_) => JobState::Expired,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == JobState::Active
    }

    pub fn describe(&self) -> String {
        describe_rule(&self.field, self.operator, &self.value, self.action)
    }
}

fn describe_rule(field: &str, operator: Operator, value: &str, action: JobAction) -> String {
    format!("if {field} {operator} {value} then {action}")
}
