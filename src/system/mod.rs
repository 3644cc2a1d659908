//! System utilities
//!
//! Resource monitoring used for load-time diagnostics.

pub mod resources;
