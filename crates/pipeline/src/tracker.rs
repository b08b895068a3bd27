//! Batch job tracker.
//!
//! Drives every job of a batch through the job state machine: builds
//! and submits jobs in input order while respecting a concurrency cap,
//! polls in-flight jobs no faster than the configured interval, enforces
//! per-job deadlines, and persists the store after every change so a
//! later run can resume without resubmitting anything.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cardsmith_comfyui::backend::{BackendError, BackendStatus, GenerationBackend};
use cardsmith_core::builder::resolve;
use cardsmith_core::features::FeatureSet;
use cardsmith_core::job::{transition, JobEvent, JobRecord, JobStatus, PollResult, SubmitFailure};
use cardsmith_core::template::WorkflowTemplate;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::store::BatchStore;
use crate::summary::BatchSummary;

/// Default number of jobs in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default per-job poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default per-job deadline, measured from submission.
pub const DEFAULT_MAX_JOB_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum jobs in flight; values below 1 are treated as 1.
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_job_duration: Duration,
    /// Reset terminal records to `pending` and run them again.
    pub force_rerun: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_job_duration: DEFAULT_MAX_JOB_DURATION,
            force_rerun: false,
        }
    }
}

/// Scheduling state of one accepted job. It is held either in the
/// waiting list or by the single operation polling it, never both, so
/// no two polls for the same key overlap.
#[derive(Debug)]
struct InFlight {
    key: String,
    job_id: String,
    next_poll: Instant,
    deadline: Instant,
}

impl InFlight {
    fn wake_at(&self) -> Instant {
        self.next_poll.min(self.deadline)
    }
}

/// Outcome of one backend operation, applied by the control loop.
enum Completion {
    Submitted {
        key: String,
        warnings: Vec<String>,
        result: Result<String, BackendError>,
        acked: Instant,
    },
    Observed {
        job: InFlight,
        event: JobEvent,
    },
}

impl Completion {
    fn key(&self) -> &str {
        match self {
            Self::Submitted { key, .. } => key,
            Self::Observed { job, .. } => &job.key,
        }
    }
}

pub struct JobTracker {
    backend: Arc<dyn GenerationBackend>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl JobTracker {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Run the batch described by `features` to completion or cancellation.
    ///
    /// Jobs are tracked under [`FeatureSet::key`]; a repeated key runs
    /// once, for its first feature set. Keys already terminal in `store`
    /// are skipped unless `force_rerun` is set. Jobs left
    /// `submitted`/`running` by an interrupted run are adopted and
    /// polled, never resubmitted.
    ///
    /// Submits and polls are awaited alongside every other job's
    /// deadline, so a slow backend call never delays a timeout. On
    /// cancellation no new job is submitted; each in-flight job gets one
    /// more outcome (its pending submit or its next poll) and the run
    /// returns with the rest left for a later resume.
    ///
    /// Only a failure to persist the store is returned as an error.
    pub async fn run(
        &self,
        store: &mut BatchStore,
        template: &WorkflowTemplate,
        features: &[FeatureSet],
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        let mut by_key: HashMap<&str, &FeatureSet> = HashMap::with_capacity(features.len());
        let mut batch_keys: Vec<&str> = Vec::with_capacity(features.len());
        for feature_set in features {
            match by_key.entry(feature_set.key()) {
                Entry::Vacant(slot) => {
                    slot.insert(feature_set);
                    batch_keys.push(feature_set.key());
                }
                Entry::Occupied(_) => {
                    tracing::warn!(key = feature_set.key(), "Repeated batch key, running it once");
                }
            }
        }

        let enrolled = store.enroll(batch_keys.iter().copied());
        let (mut pending, mut waiting) = self.prepare(store, &batch_keys);
        store.save().await?;

        tracing::info!(
            jobs = batch_keys.len(),
            enrolled,
            pending = pending.len(),
            adopted = waiting.len(),
            concurrency = self.concurrency(),
            "Batch started",
        );

        let mut active: FuturesUnordered<BoxFuture<'_, Completion>> = FuturesUnordered::new();
        let mut in_operation: HashSet<String> = HashSet::new();
        let mut drain_after_cancel: Option<HashSet<String>> = None;

        loop {
            // -- start submits while there is capacity --
            let mut started = false;
            while !cancel.is_cancelled() && waiting.len() + active.len() < self.concurrency() {
                let Some(key) = pending.pop_front() else {
                    break;
                };
                let Some(feature_set) = by_key.get(key) else {
                    continue;
                };
                started = true;
                if let Some(submit) = self.start_submit(store, template, feature_set) {
                    in_operation.insert(key.to_string());
                    active.push(submit);
                }
            }
            if started {
                store.save().await?;
            }

            if cancel.is_cancelled() && drain_after_cancel.is_none() {
                tracing::info!(
                    in_flight = waiting.len() + active.len(),
                    pending = pending.len(),
                    "Batch cancelled, draining in-flight jobs",
                );
                let mut keys: HashSet<String> = waiting.iter().map(|j| j.key.clone()).collect();
                keys.extend(in_operation.iter().cloned());
                drain_after_cancel = Some(keys);
            }

            let drained = drain_after_cancel.as_ref().is_some_and(HashSet::is_empty);
            if drained || (waiting.is_empty() && active.is_empty()) {
                break;
            }

            // -- wait for an operation, the earliest poll or deadline, or cancellation --
            let wake = waiting.iter().map(InFlight::wake_at).min();
            let finished: Vec<Completion> = tokio::select! {
                Some(done) = active.next(), if !active.is_empty() => vec![done],
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    let now = Instant::now();
                    let (due, rest): (Vec<InFlight>, Vec<InFlight>) =
                        waiting.drain(..).partition(|j| j.wake_at() <= now);
                    waiting = rest;

                    let mut expired = Vec::new();
                    for job in due {
                        if now >= job.deadline {
                            expired.push(Completion::Observed {
                                job,
                                event: JobEvent::DeadlineExceeded,
                            });
                        } else {
                            in_operation.insert(job.key.clone());
                            active.push(self.observe(job).boxed());
                        }
                    }
                    expired
                }
                _ = cancel.cancelled(), if drain_after_cancel.is_none() => continue,
                else => break,
            };

            if finished.is_empty() {
                continue;
            }
            for done in finished {
                let key = done.key().to_string();
                in_operation.remove(&key);
                let drained = drain_after_cancel
                    .as_mut()
                    .is_some_and(|keys| keys.remove(&key));
                if let Some(job) = self.settle(store, done) {
                    if !drained {
                        waiting.push(job);
                    }
                }
            }
            store.save().await?;
        }

        let summary = BatchSummary::from_records(
            store
                .records()
                .iter()
                .filter(|r| by_key.contains_key(r.user_id.as_str())),
        );
        tracing::info!(%summary, "Batch finished");
        Ok(summary)
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Apply force-rerun resets and split batch keys into the pending
    /// queue (input order) and adopted in-flight jobs.
    fn prepare<'k>(
        &self,
        store: &mut BatchStore,
        keys: &[&'k str],
    ) -> (VecDeque<&'k str>, Vec<InFlight>) {
        let mut pending = VecDeque::new();
        let mut in_flight = Vec::new();
        let now = self.clock.now();
        let now_instant = Instant::now();

        for &key in keys {
            let Some(record) = store.get(key).cloned() else {
                continue;
            };

            let reset = (record.status.is_terminal() && self.config.force_rerun)
                || (matches!(record.status, JobStatus::Submitted | JobStatus::Running)
                    && record.job_id.is_none());
            let record = if reset {
                match transition(&record, JobEvent::ForceReset, now) {
                    Ok(fresh) => {
                        tracing::info!(key, previous = %record.status, "Record reset to pending");
                        store.put(fresh.clone());
                        fresh
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Force reset rejected");
                        record
                    }
                }
            } else {
                record
            };

            match record.status {
                JobStatus::Pending => pending.push_back(key),
                JobStatus::Submitted | JobStatus::Running => {
                    if let Some(job_id) = record.job_id.clone() {
                        let remaining = record
                            .deadline(self.config.max_job_duration)
                            .and_then(|deadline| (deadline - now).to_std().ok())
                            .unwrap_or(Duration::ZERO);
                        tracing::info!(key, job_id = %job_id, "Adopting in-flight job");
                        in_flight.push(InFlight {
                            key: key.to_string(),
                            job_id,
                            next_poll: now_instant,
                            deadline: now_instant + remaining,
                        });
                    }
                }
                _ => {
                    tracing::debug!(key, status = %record.status, "Already terminal, skipping");
                }
            }
        }

        (pending, in_flight)
    }

    /// Build one job and start submitting it. A construction failure is
    /// recorded right away and nothing reaches the backend.
    fn start_submit(
        &self,
        store: &mut BatchStore,
        template: &WorkflowTemplate,
        features: &FeatureSet,
    ) -> Option<BoxFuture<'_, Completion>> {
        let key = features.key().to_string();

        let job = match resolve(template, features) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Job construction failed");
                self.apply(store, &key, JobEvent::ConstructionFailed(e.to_string()));
                return None;
            }
        };

        for warning in &job.warnings {
            tracing::warn!(key = %key, %warning, "Slot value clamped");
        }
        let warnings = features
            .notes()
            .iter()
            .cloned()
            .chain(job.warnings.iter().map(ToString::to_string))
            .collect();

        Some(
            async move {
                let result = self.backend.submit(&job).await;
                Completion::Submitted {
                    key,
                    warnings,
                    result,
                    acked: Instant::now(),
                }
            }
            .boxed(),
        )
    }

    /// Poll one due job, bounded by its deadline.
    async fn observe(&self, job: InFlight) -> Completion {
        let event = match tokio::time::timeout_at(job.deadline, self.poll_once(&job.job_id)).await {
            Ok(result) => JobEvent::Polled(result),
            Err(_) => JobEvent::DeadlineExceeded,
        };
        Completion::Observed { job, event }
    }

    async fn poll_once(&self, job_id: &str) -> PollResult {
        match self.backend.poll(job_id).await {
            Ok(BackendStatus::Queued) => PollResult::Queued,
            Ok(BackendStatus::Running) => PollResult::Running,
            Ok(BackendStatus::Done) => match self.backend.fetch_result(job_id).await {
                Ok(reference) => PollResult::Done(reference),
                Err(e) => PollResult::DoneUnreadable(e.to_string()),
            },
            Ok(BackendStatus::Error(message)) => PollResult::Error(message),
            Err(e @ BackendError::RetriesExhausted { .. }) => PollResult::Unreachable(e.to_string()),
            Err(e) if e.is_transient() => PollResult::Unreachable(e.to_string()),
            Err(e) => PollResult::Error(format!("poll failed: {e}")),
        }
    }

    /// Record a finished operation. Returns the job when it is still in
    /// flight and needs another poll.
    fn settle(&self, store: &mut BatchStore, done: Completion) -> Option<InFlight> {
        match done {
            Completion::Submitted {
                key,
                warnings,
                result: Ok(job_id),
                acked,
            } => {
                let event = JobEvent::Submitted {
                    job_id: job_id.clone(),
                    warnings,
                };
                self.apply(store, &key, event).then(|| InFlight {
                    key,
                    job_id,
                    next_poll: acked + self.config.poll_interval,
                    deadline: acked + self.config.max_job_duration,
                })
            }
            Completion::Submitted {
                key,
                result: Err(e),
                ..
            } => {
                let failure = match e {
                    BackendError::Rejected(msg) => SubmitFailure::Rejected(msg),
                    e @ (BackendError::RetriesExhausted { .. } | BackendError::Unavailable(_)) => {
                        SubmitFailure::Exhausted(e.to_string())
                    }
                    e => SubmitFailure::Other(e.to_string()),
                };
                self.apply(store, &key, JobEvent::SubmitFailed(failure));
                None
            }
            Completion::Observed { mut job, event } => {
                let polled_at = Instant::now();
                self.apply(store, &job.key, event).then(|| {
                    job.next_poll = polled_at + self.config.poll_interval;
                    job
                })
            }
        }
    }

    /// Apply `event` to the record under `key` and persist it in the
    /// store. Returns whether the event left the job in flight; a
    /// rejected event never does.
    fn apply(&self, store: &mut BatchStore, key: &str, event: JobEvent) -> bool {
        let Some(current) = store.get(key) else {
            tracing::error!(key, "No record for job");
            return false;
        };

        let next = match transition(current, event, self.clock.now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(key, status = %current.status, error = %e, "Rejected job transition");
                return false;
            }
        };

        if next.status != current.status {
            log_transition(current, &next);
        }
        let in_flight = next.is_in_flight();
        store.put(next);
        in_flight
    }
}

fn log_transition(from: &JobRecord, to: &JobRecord) {
    let job_id = to.job_id.as_deref().unwrap_or("-");
    match &to.error {
        Some(error) => tracing::warn!(
            key = %to.user_id,
            job_id,
            from = %from.status,
            to = %to.status,
            kind = %error.kind,
            error = %error.message,
            "Job transition",
        ),
        None => tracing::info!(
            key = %to.user_id,
            job_id,
            from = %from.status,
            to = %to.status,
            "Job transition",
        ),
    }
}
