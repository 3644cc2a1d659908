//! Shared type definitions
//!
//! Model summaries handed to collaborators and persisted runtime settings.

pub mod config;
pub mod model;
