//! `portfwd` Core Library
//!
//! Shared functionality for `portfwd` components:
//! - Forwards file parsing and formatting
//! - Settings resolution and hierarchy
//! - Human-readable formatting of byte counts, durations and payloads
//! - Common error types

pub mod config;
pub mod error;
pub mod format;
pub mod forwards;
pub mod tracing_init;

pub use config::{Config, EngineSettings};
pub use error::{Error, Result};
pub use forwards::{BindScope, ForwardSpec};
