//! Batch orchestration for the generation pipeline.
//!
//! Loads the batch inputs, tracks every user's job against a
//! [`GenerationBackend`](cardsmith_comfyui::backend::GenerationBackend),
//! persists progress for resumable runs and collects finished artifacts.

pub mod clock;
pub mod collector;
pub mod error;
pub mod inputs;
pub mod store;
pub mod summary;
pub mod tracker;
