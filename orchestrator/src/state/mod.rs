//! Durable, crash-safe, lock-serialized run state. The engine is the
//! idempotence substrate every phase module leans on.

mod engine;
mod model;

pub use engine::{DRY_RUN_KEY, StateEngine, default_state_dir, state_file_name};
pub use model::{ErrorRecord, Phase, RunState, SCHEMA_VERSION, StepRecord};
