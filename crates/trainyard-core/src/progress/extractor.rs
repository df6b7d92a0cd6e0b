//! Per-job progress extraction over a chunked stdout stream.

use std::sync::Arc;

use super::lines::LineSplitter;
use super::matcher::{MatcherSet, ProgressUpdate};

/// Turns stdout chunks of one job into progress updates.
///
/// Actions without registered matchers never buffer or parse anything.
#[derive(Debug)]
pub struct ProgressExtractor {
    action: String,
    matchers: Arc<MatcherSet>,
    splitter: Option<LineSplitter>,
}

impl ProgressExtractor {
    pub fn new(action: &str, matchers: Arc<MatcherSet>) -> Self {
        let splitter = matchers.parses(action).then(LineSplitter::new);
        Self {
            action: action.to_string(),
            matchers,
            splitter,
        }
    }

    /// Whether this job's output is parsed at all.
    pub const fn is_active(&self) -> bool {
        self.splitter.is_some()
    }

    /// Feed one stdout chunk; returns updates for every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<ProgressUpdate> {
        let Some(splitter) = self.splitter.as_mut() else {
            return Vec::new();
        };
        splitter
            .push(chunk)
            .iter()
            .filter_map(|line| self.matchers.match_line(&self.action, line))
            .collect()
    }

    /// End of stdout: match the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<ProgressUpdate> {
        let tail = self.splitter.as_mut()?.finish()?;
        self.matchers.match_line(&self.action, &tail)
    }
}
