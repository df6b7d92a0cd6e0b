//! `trainyard jobs`, `trainyard audit` and `trainyard programs`.

use std::io::{self, Write};

use trainyard_core::Config;

use crate::registry::ProgramRegistry;
use crate::storage::{Database, JobStateStore};

/// Recent job records, newest first, one JSON object per line.
pub(super) async fn jobs(db: &Database, limit: u32) -> anyhow::Result<()> {
    let jobs = db.list_jobs(limit).await?;
    let mut out = io::stdout().lock();
    for job in &jobs {
        writeln!(out, "{}", serde_json::to_string(job)?)?;
    }
    Ok(())
}

/// Recent audit entries, newest first, one JSON object per line.
pub(super) async fn audit(db: &Database, limit: u32) -> anyhow::Result<()> {
    let entries = db.list_audit(limit).await?;
    let mut out = io::stdout().lock();
    for entry in &entries {
        writeln!(out, "{}", serde_json::to_string(entry)?)?;
    }
    Ok(())
}

pub(super) fn programs(config: &Config) -> anyhow::Result<()> {
    let registry = ProgramRegistry::from_config(config.programs_or_default());
    let mut out = io::stdout().lock();
    for (kind, invocation) in registry.iter() {
        let line = serde_json::json!({
            "kind": kind,
            "program": invocation.program,
            "args": invocation.args,
            "config_flag": invocation.config_flag,
            "working_directory": invocation.working_directory,
        });
        writeln!(out, "{line}")?;
    }
    Ok(())
}
