pub mod engine;

pub use engine::{InitOutcome, Orchestrator, StageAdvance};
