//! Noema core library
//!
//! GGUF model introspection and the local inference runtime used by the Noema
//! desktop application.

pub mod gguf;
pub mod inference;
pub mod system;
pub mod types;
