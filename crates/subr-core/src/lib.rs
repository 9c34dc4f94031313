//! Core building blocks for subr
//!
//! This crate holds the pieces every other subr crate depends on:
//! - **Configuration**: the immutable per-run settings record
//! - **Error**: typed errors for configuration and parsing failures
//! - **Diagnostics**: the structured per-run list of degraded/per-item events

pub mod config;
pub mod diagnostics;
pub mod error;

pub use config::{Configuration, OutputFormat, Overrides};
pub use diagnostics::{Diagnostic, Diagnostics, Stage};
pub use error::{Error, Result};
