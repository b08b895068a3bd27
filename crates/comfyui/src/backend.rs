//! Generation backend abstraction and its ComfyUI implementation.
//!
//! The tracker only sees [`GenerationBackend`]: submit a resolved job,
//! poll it, fetch its result reference, download the output. Transport
//! failures are classified into [`BackendError`] kinds so callers can
//! tell a transient outage from a refused job.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use cardsmith_core::builder::ResolvedJob;
use cardsmith_core::job::ResultReference;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history_entry, HistoryEntry, QueuePosition};
use crate::retry::{with_retry, RetryPolicies};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Status of a submitted job as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Queued,
    Running,
    Done,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The service could not be reached or is overloaded. Retried.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The service refused the job graph. Never retried.
    #[error("backend rejected job: {0}")]
    Rejected(String),

    /// The service answered with something we cannot interpret.
    #[error("unexpected backend response: {0}")]
    Protocol(String),

    /// A local input file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    LocalFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<BackendError>,
    },
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<ComfyUIApiError> for BackendError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) if e.is_decode() || e.is_builder() => {
                Self::Protocol(e.to_string())
            }
            ComfyUIApiError::Request(e) => Self::Unavailable(e.to_string()),
            ComfyUIApiError::ApiError { status, body } if status >= 500 || status == 429 => {
                Self::Unavailable(format!("HTTP {status}: {body}"))
            }
            ComfyUIApiError::ApiError { status, body } if (400..500).contains(&status) => {
                Self::Rejected(format!("HTTP {status}: {body}"))
            }
            ComfyUIApiError::ApiError { status, body } => {
                Self::Protocol(format!("HTTP {status}: {body}"))
            }
            ComfyUIApiError::Upload { path, source } => Self::LocalFile { path, source },
        }
    }
}

/// An external image-generation service with submit/poll semantics.
///
/// `poll` must be free of side effects on the backend so it can be
/// called repeatedly.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Hand a resolved job to the backend and return its job id.
    async fn submit(&self, job: &ResolvedJob) -> Result<String, BackendError>;

    async fn poll(&self, job_id: &str) -> Result<BackendStatus, BackendError>;

    /// Output reference of a job whose poll returned `Done`.
    async fn fetch_result(&self, job_id: &str) -> Result<ResultReference, BackendError>;

    async fn download(&self, reference: &ResultReference) -> Result<Vec<u8>, BackendError>;
}

// ---------------------------------------------------------------------------
// ComfyUI implementation
// ---------------------------------------------------------------------------

/// [`GenerationBackend`] over the ComfyUI REST API.
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    retry: RetryPolicies,
    /// Local files already uploaded by this process.
    uploaded: Mutex<HashSet<PathBuf>>,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi, retry: RetryPolicies) -> Self {
        Self {
            api,
            retry,
            uploaded: Mutex::new(HashSet::new()),
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Single `GET /system_stats` round trip, no retries.
    pub async fn health_check(&self) -> Result<serde_json::Value, BackendError> {
        Ok(self.api.system_stats().await?)
    }

    async fn history_entry(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, BackendError> {
        let body = self.api.get_history(prompt_id).await?;
        parse_history_entry(prompt_id, &body)
            .map_err(|e| BackendError::Protocol(format!("malformed history for {prompt_id}: {e}")))
    }

    async fn upload_once(&self, path: &Path) -> Result<(), BackendError> {
        if self.is_uploaded(path) {
            return Ok(());
        }

        let uploaded = with_retry("upload", &self.retry.submit, || async move {
            self.api.upload_image(path).await.map_err(BackendError::from)
        })
        .await?;
        tracing::debug!(path = %path.display(), name = %uploaded.name, "Uploaded input image");

        if let Ok(mut set) = self.uploaded.lock() {
            set.insert(path.to_path_buf());
        }
        Ok(())
    }

    fn is_uploaded(&self, path: &Path) -> bool {
        self.uploaded
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(false)
    }
}

/// Map a finished history entry onto a terminal status.
fn terminal_status(entry: &HistoryEntry) -> Option<BackendStatus> {
    if entry.is_error() {
        Some(BackendStatus::Error(entry.error_message()))
    } else if entry.is_completed() {
        Some(BackendStatus::Done)
    } else {
        None
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIBackend {
    async fn submit(&self, job: &ResolvedJob) -> Result<String, BackendError> {
        for path in &job.uploads {
            self.upload_once(path).await?;
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let client_id = client_id.as_str();
        let response = with_retry("submit", &self.retry.submit, || async move {
            self.api
                .submit_workflow(&job.graph, client_id)
                .await
                .map_err(BackendError::from)
        })
        .await?;

        let has_node_errors = match &response.node_errors {
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        };
        if has_node_errors {
            return Err(BackendError::Rejected(format!(
                "node errors: {}",
                response.node_errors
            )));
        }

        tracing::debug!(
            key = %job.key,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Prompt queued",
        );
        Ok(response.prompt_id)
    }

    async fn poll(&self, job_id: &str) -> Result<BackendStatus, BackendError> {
        let policy = &self.retry.poll;

        if let Some(entry) = with_retry("poll", policy, || self.history_entry(job_id)).await? {
            if let Some(status) = terminal_status(&entry) {
                return Ok(status);
            }
        }

        let queue = with_retry("poll", policy, || async move {
            self.api.get_queue().await.map_err(BackendError::from)
        })
        .await?;
        match queue.position(job_id) {
            QueuePosition::Running => Ok(BackendStatus::Running),
            QueuePosition::Pending => Ok(BackendStatus::Queued),
            QueuePosition::Absent => {
                // It may have finished between the two requests.
                let entry = with_retry("poll", policy, || self.history_entry(job_id)).await?;
                Ok(match entry {
                    Some(entry) => terminal_status(&entry).unwrap_or_else(|| {
                        BackendStatus::Error("execution ended without a final status".to_string())
                    }),
                    None => BackendStatus::Error(format!("prompt {job_id} is unknown to the backend")),
                })
            }
        }
    }

    async fn fetch_result(&self, job_id: &str) -> Result<ResultReference, BackendError> {
        let entry = with_retry("fetch_result", &self.retry.fetch, || self.history_entry(job_id))
            .await?
            .ok_or_else(|| BackendError::Protocol(format!("no history entry for {job_id}")))?;

        entry
            .first_output_image()
            .ok_or_else(|| BackendError::Protocol(format!("no output image recorded for {job_id}")))
    }

    async fn download(&self, reference: &ResultReference) -> Result<Vec<u8>, BackendError> {
        with_retry("download", &self.retry.fetch, || async move {
            self.api.view(reference).await.map_err(BackendError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn api_error(status: u16) -> BackendError {
        BackendError::from(ComfyUIApiError::ApiError {
            status,
            body: "{}".into(),
        })
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert_matches!(api_error(500), BackendError::Unavailable(_));
        assert_matches!(api_error(503), BackendError::Unavailable(_));
        assert_matches!(api_error(429), BackendError::Unavailable(_));
        assert!(api_error(502).is_transient());
    }

    #[test]
    fn client_errors_are_rejections() {
        assert_matches!(api_error(400), BackendError::Rejected(_));
        assert_matches!(api_error(404), BackendError::Rejected(_));
        assert!(!api_error(400).is_transient());
    }

    #[test]
    fn unexpected_status_is_protocol_error() {
        assert_matches!(api_error(302), BackendError::Protocol(_));
    }

    #[test]
    fn unreadable_upload_maps_to_local_file() {
        let err = BackendError::from(ComfyUIApiError::Upload {
            path: "/nope.png".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        assert_matches!(err, BackendError::LocalFile { .. });
        assert!(!err.is_transient());
    }
}
