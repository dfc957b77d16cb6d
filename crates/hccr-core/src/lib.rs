//! Core types and utilities for handwritten Chinese character recognition.
//!
//! Errors, configuration, shared data types and metrics used by the dataset,
//! training and tool crates.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;
