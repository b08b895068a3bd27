//! Aggregate outcome of a batch, computed from its job records.

use std::collections::BTreeMap;

use serde::Serialize;

use cardsmith_core::job::{FailureKind, JobRecord, JobStatus};
use cardsmith_core::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub user_id: UserId,
    pub status: JobStatus,
    pub kind: Option<FailureKind>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    pub by_failure: BTreeMap<FailureKind, usize>,
    /// One entry per failed or timed-out user, in record order.
    pub failures: Vec<FailureReport>,
}

impl BatchSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut summary = Self::default();

        for record in records {
            summary.total += 1;
            *summary.by_status.entry(record.status).or_default() += 1;

            if matches!(record.status, JobStatus::Failed | JobStatus::TimedOut) {
                let kind = record.error.as_ref().map(|e| e.kind);
                if let Some(kind) = kind {
                    *summary.by_failure.entry(kind).or_default() += 1;
                }
                summary.failures.push(FailureReport {
                    user_id: record.user_id.clone(),
                    status: record.status,
                    kind,
                    message: record
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_default(),
                });
            }
        }

        summary
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Every record reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.by_status
            .iter()
            .all(|(status, _)| status.is_terminal())
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} users", self.total)?;
        for (status, count) in &self.by_status {
            write!(f, ", {count} {status}")?;
        }
        Ok(())
    }
}
