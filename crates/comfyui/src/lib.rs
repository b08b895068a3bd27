//! ComfyUI REST client and generation backend.
//!
//! Provides the HTTP API wrapper, typed history/queue payloads, the
//! retry policy for transient failures, and the [`GenerationBackend`]
//! implementation the job tracker drives.
//!
//! [`GenerationBackend`]: backend::GenerationBackend

pub mod api;
pub mod backend;
pub mod history;
pub mod retry;
