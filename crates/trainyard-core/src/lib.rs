//! `Trainyard` Core Library
//!
//! Shared functionality for the job orchestrator:
//! - Progress extraction from raw program output
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and timestamps
//! - Common error types and tracing setup

pub mod config;
pub mod db;
pub mod error;
pub mod progress;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use progress::{MatcherSet, ProgressExtractor, ProgressUpdate};
