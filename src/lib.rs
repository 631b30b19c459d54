//! Conditional-trigger jobs for WireGuard peers.
//!
//! A job watches one peer and fires a one-shot action (restrict, delete or
//! reset usage) once its condition holds. Jobs live in SQLite, every change
//! and firing is written to an audit log, and [`PeerJobs::run_job`] is the
//! per-tick evaluation pass driven by [`scheduler::Scheduler`].

pub mod audit;
pub mod compare;
pub mod error;
pub mod job;
pub mod registry;
mod runner;
pub mod scheduler;
pub mod service;
pub mod store;

pub use audit::{AuditEntry, AuditLog, SqliteAuditLog};
pub use error::{JobError, Result, SkipReason};
pub use job::{Evaluation, FieldKind, Job, JobAction, JobDraft, JobState, Operator};
pub use registry::{MemoryRegistry, PeerRegistry};
pub use service::PeerJobs;
pub use store::{JobStore, RestoreSummary};
