//! Configuration
//!
//! Error types, protocol limits and runtime settings.

pub mod settings;
pub mod types;
