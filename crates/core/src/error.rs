/// Errors raised while loading the static documents that drive a batch.
///
/// Per-user problems are not errors at this level: the feature mapper
/// records them as notes and the job builder returns a
/// [`ConstructionError`](crate::builder::ConstructionError).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),
}
