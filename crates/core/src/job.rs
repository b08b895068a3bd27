//! Per-user job state machine.
//!
//! A [`JobRecord`] moves `pending -> submitted -> running -> {succeeded |
//! failed | timed_out}`. Every change goes through [`transition`], a pure
//! function of the current record, an event and the current time, so the
//! tracker's behaviour can be tested without a backend.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Timestamp, UserId};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
    ];

    /// Terminal states are never left except by an explicit force reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Why a record ended in `failed` or `timed_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Template binding failed; the job never reached the backend.
    Construction,
    BackendRejected,
    /// The job ran and the backend reported an execution error.
    BackendRuntime,
    /// The backend reported success but the result could not be fetched.
    ResultUnreadable,
    /// The result could not be turned into a local artifact.
    Collection,
    Deadline,
    RetriesExhausted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Construction => "construction",
            Self::BackendRejected => "backend_rejected",
            Self::BackendRuntime => "backend_runtime",
            Self::ResultUnreadable => "result_unreadable",
            Self::Collection => "collection",
            Self::Deadline => "deadline",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
}

/// Opaque pointer to a generated output on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReference {
    /// Graph node that produced the output.
    pub node_id: String,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Backend storage area, e.g. `output` or `temp`.
    #[serde(rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Batch key: the user id, or `<user_id>_<seed_id>` when a style
    /// seed is fused into the job.
    pub user_id: UserId,
    /// Backend-assigned id, absent before submission.
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub submitted_at: Option<Timestamp>,
    pub last_polled_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Number of times this user's job has been handed to the backend.
    #[serde(default)]
    pub submit_count: u32,
    /// Present only when `succeeded`.
    pub result: Option<ResultReference>,
    /// Present only when `failed` or `timed_out`.
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Local file produced by the artifact collector.
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

impl JobRecord {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            job_id: None,
            status: JobStatus::Pending,
            submitted_at: None,
            last_polled_at: None,
            completed_at: None,
            submit_count: 0,
            result: None,
            error: None,
            warnings: Vec::new(),
            artifact: None,
        }
    }

    /// Submitted to the backend and not yet terminal.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, JobStatus::Submitted | JobStatus::Running) && self.job_id.is_some()
    }

    /// Deadline measured from this job's own submit time.
    pub fn deadline(&self, max_duration: Duration) -> Option<Timestamp> {
        let max = chrono::Duration::from_std(max_duration).ok()?;
        self.submitted_at.map(|at| at + max)
    }

    /// True once `now` has reached the job's deadline.
    pub fn is_past_deadline(&self, now: Timestamp, max_duration: Duration) -> bool {
        self.deadline(max_duration).is_some_and(|deadline| now >= deadline)
    }

    fn terminate(mut self, status: JobStatus, kind: FailureKind, message: String, now: Timestamp) -> Self {
        self.status = status;
        self.result = None;
        self.error = Some(ErrorDetail { kind, message });
        self.completed_at = Some(now);
        self
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Outcome of one poll of an in-flight job, after any result fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Queued,
    Running,
    /// Done and the result reference was fetched.
    Done(ResultReference),
    /// Done, but the result reference could not be fetched.
    DoneUnreadable(String),
    /// The backend reported an execution error.
    Error(String),
    /// Transient failures exceeded the retry ceiling.
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFailure {
    /// The backend refused the job graph. Never retried.
    Rejected(String),
    /// Transient failures exceeded the retry ceiling.
    Exhausted(String),
    /// Any other failure (upload, malformed response).
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    ConstructionFailed(String),
    Submitted { job_id: String, warnings: Vec<String> },
    SubmitFailed(SubmitFailure),
    Polled(PollResult),
    DeadlineExceeded,
    /// The backend reported success but no usable artifact came out of it.
    CollectionFailed(String),
    ForceReset,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConstructionFailed(_) => "construction_failed",
            Self::Submitted { .. } => "submitted",
            Self::SubmitFailed(_) => "submit_failed",
            Self::Polled(_) => "polled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::CollectionFailed(_) => "collection_failed",
            Self::ForceReset => "force_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply '{event}' to job for user {user_id} in status '{from}'")]
pub struct InvalidTransition {
    pub user_id: UserId,
    pub from: JobStatus,
    pub event: &'static str,
}

// ---------------------------------------------------------------------------
// Transition function
// ---------------------------------------------------------------------------

/// Apply `event` to `record` at time `now`.
///
/// Terminal records reject every event except [`JobEvent::ForceReset`]
/// and, for `succeeded` records, [`JobEvent::CollectionFailed`].
pub fn transition(
    record: &JobRecord,
    event: JobEvent,
    now: Timestamp,
) -> Result<JobRecord, InvalidTransition> {
    use JobStatus::*;

    let invalid = |event: &JobEvent| InvalidTransition {
        user_id: record.user_id.clone(),
        from: record.status,
        event: event.name(),
    };

    let next = record.clone();
    match (record.status, event) {
        (_, JobEvent::ForceReset) => {
            let mut fresh = JobRecord::new(record.user_id.clone());
            fresh.submit_count = record.submit_count;
            Ok(fresh)
        }

        // -- pending --
        (Pending, JobEvent::ConstructionFailed(message)) => {
            Ok(next.terminate(Failed, FailureKind::Construction, message, now))
        }
        (Pending, JobEvent::Submitted { job_id, warnings }) => {
            let mut next = next;
            next.status = Submitted;
            next.job_id = Some(job_id);
            next.submitted_at = Some(now);
            next.submit_count += 1;
            next.warnings = warnings;
            Ok(next)
        }
        (Pending, JobEvent::SubmitFailed(failure)) => Ok(match failure {
            SubmitFailure::Rejected(message) => {
                next.terminate(Failed, FailureKind::BackendRejected, message, now)
            }
            SubmitFailure::Exhausted(message) => {
                next.terminate(TimedOut, FailureKind::RetriesExhausted, message, now)
            }
            SubmitFailure::Other(message) => {
                next.terminate(Failed, FailureKind::BackendRuntime, message, now)
            }
        }),

        // -- in flight --
        (Submitted | Running, JobEvent::Polled(result)) => {
            let mut next = next;
            next.last_polled_at = Some(now);
            Ok(match result {
                PollResult::Queued | PollResult::Running => {
                    next.status = Running;
                    next
                }
                PollResult::Done(reference) => {
                    next.status = Succeeded;
                    next.result = Some(reference);
                    next.error = None;
                    next.completed_at = Some(now);
                    next
                }
                PollResult::DoneUnreadable(message) => {
                    next.terminate(Failed, FailureKind::ResultUnreadable, message, now)
                }
                PollResult::Error(message) => {
                    next.terminate(Failed, FailureKind::BackendRuntime, message, now)
                }
                PollResult::Unreachable(message) => {
                    next.terminate(TimedOut, FailureKind::RetriesExhausted, message, now)
                }
            })
        }
        (Submitted | Running, JobEvent::DeadlineExceeded) => {
            let message = match record.submitted_at {
                Some(at) => format!("no terminal status since submission at {}", at.to_rfc3339()),
                None => "no terminal status before deadline".to_string(),
            };
            Ok(next.terminate(TimedOut, FailureKind::Deadline, message, now))
        }

        // -- post-success --
        (Succeeded, JobEvent::CollectionFailed(message)) => {
            let mut next = next.terminate(Failed, FailureKind::Collection, message, now);
            next.artifact = None;
            Ok(next)
        }

        (_, event) => Err(invalid(&event)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
