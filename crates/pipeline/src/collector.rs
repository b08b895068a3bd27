//! Artifact collection for succeeded jobs.
//!
//! Resolves each succeeded record's backend reference into a local
//! image under `final_images/`, verifies it, and publishes a manifest
//! mapping every batch key to a ready artifact or a failure reason for
//! the card-assembly step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cardsmith_comfyui::backend::{BackendError, GenerationBackend};
use cardsmith_core::features::{FeatureSet, FeatureValue, FEATURE_FILENAME_PREFIX};
use cardsmith_core::job::{transition, JobEvent, JobRecord, JobStatus};
use cardsmith_core::types::{Timestamp, UserId};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::store::BatchStore;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("job is {0}, only succeeded jobs can be collected")]
    NotSucceeded(JobStatus),

    #[error("succeeded job has no result reference")]
    MissingReference,

    #[error("download failed: {0}")]
    Download(#[from] BackendError),

    #[error("downloaded output is empty")]
    Empty,

    #[error("output is not a PNG, JPEG or WebP image")]
    UnsupportedFormat,

    #[error("'{0}' is not a plain file name")]
    UnsafeName(String),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactEntry {
    Ready { path: PathBuf },
    Failed { status: JobStatus, reason: String },
}

/// Batch key -> local artifact or failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub generated_at: Timestamp,
    pub entries: BTreeMap<UserId, ArtifactEntry>,
}

impl ArtifactManifest {
    pub fn ready_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, ArtifactEntry::Ready { .. }))
            .count()
    }

    pub async fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| PipelineError::json(path, e))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| PipelineError::io(path, e))
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

pub struct ArtifactCollector {
    backend: Arc<dyn GenerationBackend>,
    clock: Arc<dyn Clock>,
    images_dir: PathBuf,
}

impl ArtifactCollector {
    /// `images_dir` receives `<filename_prefix>.<ext>` files.
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        clock: Arc<dyn Clock>,
        images_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            clock,
            images_dir: images_dir.into(),
        }
    }

    /// Resolve one succeeded record into a verified local file.
    pub async fn collect(
        &self,
        record: &JobRecord,
        file_stem: &str,
    ) -> Result<PathBuf, CollectionError> {
        if record.status != JobStatus::Succeeded {
            return Err(CollectionError::NotSucceeded(record.status));
        }
        let reference = record.result.as_ref().ok_or(CollectionError::MissingReference)?;

        if let Some(existing) = &record.artifact {
            if is_valid_artifact(existing).await {
                tracing::debug!(user_id = %record.user_id, path = %existing.display(), "Artifact already collected");
                return Ok(existing.clone());
            }
        }

        if !is_plain_file_stem(file_stem) {
            return Err(CollectionError::UnsafeName(file_stem.to_string()));
        }

        let bytes = self.backend.download(reference).await?;
        let extension = image_extension(&bytes)?;

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .map_err(|source| CollectionError::Write {
                path: self.images_dir.clone(),
                source,
            })?;
        let path = self.images_dir.join(format!("{file_stem}.{extension}"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| CollectionError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::info!(
            user_id = %record.user_id,
            path = %path.display(),
            bytes = bytes.len(),
            "Artifact collected",
        );
        Ok(path)
    }

    /// Collect every succeeded record of the batch, demote failures,
    /// persist the store and return the manifest.
    pub async fn collect_batch(
        &self,
        store: &mut BatchStore,
        features: &[FeatureSet],
    ) -> Result<ArtifactManifest, PipelineError> {
        let mut entries = BTreeMap::new();

        for feature_set in features {
            let key = feature_set.key();
            let Some(record) = store.get(key).cloned() else {
                continue;
            };

            let entry = if record.status == JobStatus::Succeeded {
                let stem = file_stem(feature_set);
                match self.collect(&record, &stem).await {
                    Ok(path) => {
                        let mut updated = record;
                        updated.artifact = Some(path.clone());
                        store.put(updated);
                        ArtifactEntry::Ready { path }
                    }
                    Err(e) => {
                        tracing::warn!(key, error = %e, "Artifact collection failed");
                        let reason = e.to_string();
                        match transition(&record, JobEvent::CollectionFailed(reason.clone()), self.clock.now()) {
                            Ok(demoted) => store.put(demoted),
                            Err(e) => tracing::error!(error = %e, "Rejected collection demotion"),
                        }
                        ArtifactEntry::Failed {
                            status: JobStatus::Failed,
                            reason,
                        }
                    }
                }
            } else {
                ArtifactEntry::Failed {
                    status: record.status,
                    reason: record
                        .error
                        .as_ref()
                        .map(|e| format!("{}: {}", e.kind, e.message))
                        .unwrap_or_else(|| format!("job is {}", record.status)),
                }
            };
            entries.insert(key.to_string(), entry);
        }

        store.save().await?;

        Ok(ArtifactManifest {
            generated_at: self.clock.now(),
            entries,
        })
    }
}

fn file_stem(features: &FeatureSet) -> String {
    match features.get(FEATURE_FILENAME_PREFIX) {
        Some(FeatureValue::Text(prefix)) if !prefix.is_empty() => prefix.clone(),
        _ => features.key().to_string(),
    }
}

fn is_plain_file_stem(stem: &str) -> bool {
    !stem.is_empty()
        && stem != "."
        && stem != ".."
        && !stem.contains(['/', '\\'])
        && Path::new(stem).components().count() == 1
}

fn image_extension(bytes: &[u8]) -> Result<&'static str, CollectionError> {
    if bytes.is_empty() {
        return Err(CollectionError::Empty);
    }
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => Ok("png"),
        Ok(image::ImageFormat::Jpeg) => Ok("jpg"),
        Ok(image::ImageFormat::WebP) => Ok("webp"),
        _ => Err(CollectionError::UnsupportedFormat),
    }
}

async fn is_valid_artifact(path: &Path) -> bool {
    match tokio::fs::read(path).await {
        Ok(bytes) => image_extension(&bytes).is_ok(),
        Err(_) => false,
    }
}
