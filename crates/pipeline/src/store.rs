//! Persisted batch state.
//!
//! The store holds one [`JobRecord`] per user in enrollment order and is
//! owned by whoever drives the batch; nothing else mutates it. Saving is
//! explicit and atomic (write to a temp file, then rename) so an
//! interrupted run leaves the previous state readable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cardsmith_core::job::JobRecord;

use crate::error::PipelineError;

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: Vec<JobRecord>,
}

#[derive(Debug, Default)]
pub struct BatchStore {
    path: Option<PathBuf>,
    records: Vec<JobRecord>,
}

impl BatchStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`, or start empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StoreFile =
                    serde_json::from_slice(&bytes).map_err(|e| PipelineError::json(&path, e))?;
                if file.version != STORE_FORMAT_VERSION {
                    return Err(PipelineError::Input(format!(
                        "{} has store format version {}, expected {STORE_FORMAT_VERSION}",
                        path.display(),
                        file.version
                    )));
                }
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(PipelineError::io(&path, e)),
        };

        tracing::debug!(path = %path.display(), records = records.len(), "Opened batch store");
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn get(&self, user_id: &str) -> Option<&JobRecord> {
        self.records.iter().find(|r| r.user_id == user_id)
    }

    /// Add a `pending` record for every user not yet in the store.
    /// Returns how many were added.
    pub fn enroll<'a>(&mut self, user_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut added = 0;
        for user_id in user_ids {
            if self.get(user_id).is_none() {
                self.records.push(JobRecord::new(user_id));
                added += 1;
            }
        }
        added
    }

    /// Replace the record for `record.user_id`, appending it if absent.
    pub fn put(&mut self, record: JobRecord) {
        match self.records.iter_mut().find(|r| r.user_id == record.user_id) {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    /// Write the store to its path. No-op for in-memory stores.
    pub async fn save(&self) -> Result<(), PipelineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }

        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            records: self.records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|e| PipelineError::json(path, e))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| PipelineError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use cardsmith_core::job::JobStatus;

    use super::*;

    #[test]
    fn enroll_keeps_order_and_skips_known_users() {
        let mut store = BatchStore::in_memory();
        assert_eq!(store.enroll(["b", "a", "b"]), 2);
        assert_eq!(store.enroll(["a", "c"]), 1);
        let ids: Vec<_> = store.records().iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(store.records().iter().all(|r| r.status == JobStatus::Pending));
    }

    #[test]
    fn put_replaces_existing_record() {
        let mut store = BatchStore::in_memory();
        store.enroll(["a"]);
        let mut rec = JobRecord::new("a");
        rec.status = JobStatus::Failed;
        store.put(rec);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.get("a").unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchStore::open(dir.path().join("batch_state.json")).await.unwrap();
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn save_then_open_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("batch_state.json");

        let mut store = BatchStore::open(&path).await.unwrap();
        store.enroll(["1", "2"]);
        let mut rec = JobRecord::new("2");
        rec.status = JobStatus::Running;
        rec.job_id = Some("p-9".into());
        store.put(rec.clone());
        store.save().await.unwrap();

        let reopened = BatchStore::open(&path).await.unwrap();
        assert_eq!(reopened.records().len(), 2);
        assert_eq!(reopened.get("2"), Some(&rec));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert_matches!(BatchStore::open(&path).await, Err(PipelineError::Json { .. }));
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_state.json");
        std::fs::write(&path, br#"{"version": 99, "records": []}"#).unwrap();
        assert_matches!(BatchStore::open(&path).await, Err(PipelineError::Input(_)));
    }
}
