//! Progress extraction from unstructured program output.
//!
//! Output arrives as arbitrary chunks. [`LineSplitter`] reassembles lines,
//! [`ProgressMatcher`] implementations map a line to a percentage, and
//! [`ProgressExtractor`] ties both together for a single job.

mod extractor;
mod lines;
mod matcher;

pub use extractor::ProgressExtractor;
pub use lines::LineSplitter;
pub use matcher::{MatcherSet, ProgressMatcher, ProgressUpdate, RatioMatcher};
