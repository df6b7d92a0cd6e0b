//! Line matchers turning raw program output into progress percentages.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;

/// Default training progress line, e.g. `Epoch 3/10`.
#[allow(clippy::expect_used)]
static EPOCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bepoch\s+(?P<current>\d+)\s*/\s*(?P<total>\d+)")
        .expect("static regex is valid")
});

/// A progress observation extracted from one output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Normalized progress, always within `0..=100`.
    pub percent: u8,
    /// The trimmed raw line the percentage came from.
    pub line: String,
}

/// Pure function from one complete output line to an optional update.
pub trait ProgressMatcher: Send + Sync {
    fn match_line(&self, line: &str) -> Option<ProgressUpdate>;
}

/// Matches `<current>/<total>` style counters via a regex with named
/// `current` and `total` groups.
#[derive(Debug, Clone)]
pub struct RatioMatcher {
    regex: Regex,
}

impl RatioMatcher {
    /// Build a matcher from a pattern with `current` and `total` groups.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    /// Case-insensitive `Epoch <current>/<total>`.
    pub fn epoch() -> Self {
        Self {
            regex: EPOCH_RE.clone(),
        }
    }
}

impl ProgressMatcher for RatioMatcher {
    fn match_line(&self, line: &str) -> Option<ProgressUpdate> {
        let caps = self.regex.captures(line)?;
        let current: u64 = caps.name("current")?.as_str().parse().ok()?;
        let total: u64 = caps.name("total")?.as_str().parse().ok()?;
        if total == 0 {
            return None;
        }

        let percent = (u128::from(current) * 100 / u128::from(total)).min(100);
        Some(ProgressUpdate {
            percent: u8::try_from(percent).unwrap_or(100),
            line: line.trim().to_string(),
        })
    }
}

/// Matchers keyed by job action.
#[derive(Default)]
pub struct MatcherSet {
    by_action: HashMap<String, Vec<Box<dyn ProgressMatcher>>>,
}

impl MatcherSet {
    /// An empty set: no action reports progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default set: `train` reports epoch progress.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register("train", RatioMatcher::epoch());
        set
    }

    /// Add a matcher for `action`. Earlier registrations win on conflicts.
    pub fn register(&mut self, action: &str, matcher: impl ProgressMatcher + 'static) {
        self.by_action
            .entry(action.to_string())
            .or_default()
            .push(Box::new(matcher));
    }

    /// Whether any matcher is registered for `action`.
    pub fn parses(&self, action: &str) -> bool {
        self.by_action.get(action).is_some_and(|m| !m.is_empty())
    }

    /// Run the action's matchers over `line`; first hit wins.
    pub fn match_line(&self, action: &str, line: &str) -> Option<ProgressUpdate> {
        self.by_action
            .get(action)?
            .iter()
            .find_map(|m| m.match_line(line))
    }
}

impl std::fmt::Debug for MatcherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<_> = self.by_action.keys().collect();
        actions.sort();
        f.debug_struct("MatcherSet")
            .field("actions", &actions)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn epoch(line: &str) -> Option<ProgressUpdate> {
        RatioMatcher::epoch().match_line(line)
    }

    #[test]
    fn epoch_line_yields_percent() {
        let update = epoch("Epoch 3/10").unwrap();
        assert_eq!(update.percent, 30);
        assert_eq!(update.line, "Epoch 3/10");
    }

    #[test]
    fn epoch_match_is_case_insensitive_and_trimmed() {
        let update = epoch("   EPOCH 45/100   loss=0.31 ").unwrap();
        assert_eq!(update.percent, 45);
        assert_eq!(update.line, "EPOCH 45/100   loss=0.31");
    }

    #[test]
    fn final_epoch_is_exactly_100() {
        assert_eq!(epoch("Epoch 100/100").unwrap().percent, 100);
    }

    #[test]
    fn overshooting_counter_is_clamped() {
        assert_eq!(epoch("Epoch 12/10").unwrap().percent, 100);
    }

    #[test]
    fn zero_total_is_not_a_match() {
        assert!(epoch("Epoch 3/0").is_none());
    }

    #[test]
    fn unrelated_lines_do_not_match() {
        assert!(epoch("Epochs: 100").is_none());
        assert!(epoch("Model: yolov8n.pt").is_none());
        assert!(epoch("").is_none());
    }

    #[test]
    fn huge_numbers_do_not_overflow() {
        assert!(epoch("Epoch 99999999999999999999999/1").is_none());
        let update = epoch("Epoch 18446744073709551615/18446744073709551615").unwrap();
        assert_eq!(update.percent, 100);
    }

    #[test]
    fn custom_ratio_pattern() {
        let matcher = RatioMatcher::new(r"step (?P<current>\d+) of (?P<total>\d+)").unwrap();
        assert_eq!(matcher.match_line("step 1 of 4").unwrap().percent, 25);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(RatioMatcher::new("(unclosed").is_err());
    }

    #[test]
    fn default_set_only_parses_training() {
        let set = MatcherSet::with_defaults();
        assert!(set.parses("train"));
        assert!(!set.parses("predict"));
        assert_eq!(set.match_line("train", "Epoch 1/4").unwrap().percent, 25);
        assert!(set.match_line("predict", "Epoch 1/4").is_none());
    }

    #[test]
    fn registered_matchers_are_tried_in_order() {
        let mut set = MatcherSet::new();
        set.register(
            "convert",
            RatioMatcher::new(r"file (?P<current>\d+)/(?P<total>\d+)").unwrap(),
        );
        set.register("convert", RatioMatcher::epoch());
        assert_eq!(set.match_line("convert", "file 1/2").unwrap().percent, 50);
        assert_eq!(set.match_line("convert", "Epoch 1/5").unwrap().percent, 20);
    }
}
