//! Live event delivery for job attempts.

pub mod multiplexer;
pub mod types;

pub use multiplexer::EventMultiplexer;
pub use types::{EventStream, JobEvent, MultiplexerError, TerminalOutcome};
