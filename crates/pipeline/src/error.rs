use std::path::PathBuf;

use cardsmith_core::error::CoreError;

/// Errors that abort a pipeline stage as a whole.
///
/// Per-user failures never surface here; they are recorded on the
/// user's job record instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Malformed CSV in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        source: csv::Error,
    },

    #[error("Invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
