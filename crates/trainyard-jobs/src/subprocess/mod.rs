//! Spawning and supervising job processes.

mod decode;
pub mod supervisor;

pub use decode::Utf8Decoder;
pub use supervisor::{
    ExitOutcome, ProcessEvent, ProcessSupervisor, SpawnError, SupervisedProcess,
};
