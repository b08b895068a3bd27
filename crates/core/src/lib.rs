//! Domain logic for the personalized generation pipeline.
//!
//! Everything here is synchronous and backend-agnostic: feature mapping,
//! workflow templates, job construction and the per-user job state
//! machine.

pub mod builder;
pub mod error;
pub mod features;
pub mod hashing;
pub mod job;
pub mod template;
pub mod types;
