//! Allow-list of runnable programs.
//!
//! A job's `kind` must match a registered entry exactly. Nothing about the
//! kind string is interpreted: no trimming, case folding or path handling,
//! so a request can never steer which executable runs or with what fixed
//! arguments.

use std::collections::BTreeMap;
use std::path::PathBuf;

use trainyard_core::config::ProgramConfig;

/// How to launch one registered program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Flag preceding the staged config path; positional when `None`.
    pub config_flag: Option<String>,
    pub working_directory: Option<PathBuf>,
}

impl Invocation {
    /// Full argument list for a run with the given staged config path.
    pub fn args_with_config(&self, config_path: &std::path::Path) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(flag) = &self.config_flag {
            args.push(flag.clone());
        }
        args.push(config_path.to_string_lossy().into_owned());
        args
    }
}

impl From<ProgramConfig> for Invocation {
    fn from(config: ProgramConfig) -> Self {
        Self {
            program: config.program,
            args: config.args,
            config_flag: config.config_flag,
            working_directory: config.working_directory,
        }
    }
}

/// The requested kind is not on the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job kind: {kind:?}")]
pub struct RejectedKind {
    pub kind: String,
}

/// Immutable kind → invocation map.
#[derive(Debug, Clone, Default)]
pub struct ProgramRegistry {
    entries: BTreeMap<String, Invocation>,
}

impl ProgramRegistry {
    pub fn new(entries: impl IntoIterator<Item = (String, Invocation)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Build from the resolved `programs` configuration section.
    pub fn from_config(programs: BTreeMap<String, ProgramConfig>) -> Self {
        Self::new(
            programs
                .into_iter()
                .map(|(kind, program)| (kind, Invocation::from(program))),
        )
    }

    /// Look up `kind` by exact string equality.
    pub fn resolve(&self, kind: &str) -> Result<&Invocation, RejectedKind> {
        self.entries.get(kind).ok_or_else(|| RejectedKind {
            kind: kind.to_string(),
        })
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Invocation)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
