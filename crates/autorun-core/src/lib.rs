pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod feedback;
pub mod gates;
pub mod plan;
pub mod prompt;
pub mod pulse;
pub mod recovery;
pub mod runner;
pub mod step_exec;
pub mod store;
pub mod stream;
pub mod think;

#[cfg(test)]
mod testing;

pub use collaborators::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use pulse::PulseSink;
pub use runner::RunSequence;
pub use store::*;
pub use stream::{bridge, Coalescer, EventStream, StepSequence, StopCheck};
