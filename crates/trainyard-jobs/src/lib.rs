//! Trainyard Jobs Library
//!
//! Runs external training and inference programs as supervised jobs:
//! - Program registry: the allow-list of runnable job kinds
//! - Config staging: per-attempt parameter files handed to the program
//! - Process supervision with optional timeouts
//! - Live event streaming with progress extraction
//! - `SQLite` job state store and audit log

pub mod cli;
pub mod orchestrator;
pub mod registry;
pub mod staging;
pub mod storage;
pub mod stream;
pub mod subprocess;

pub use orchestrator::{AggregateResult, AttemptReport, JobHandle, JobRequest, Orchestrator};
pub use registry::{Invocation, ProgramRegistry, RejectedKind};
