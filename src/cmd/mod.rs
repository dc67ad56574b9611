//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                          |
//! |--------------|-------------------------------------------|
//! | `project`    | `Init`, `Status`                          |
//! | `run`        | `RunStage`, `Validate`                    |
//! | `checkpoint` | `Checkpoint create`, `list`, `restore`    |
//!
//! Every handler maps to exactly one orchestrator or checkpoint-manager
//! call and returns the process exit code: 0 success, 1 error (via `?`),
//! 2 blocked-by-gate.

pub mod checkpoint;
pub mod project;
pub mod run;

pub use checkpoint::{cmd_checkpoint_create, cmd_checkpoint_list, cmd_checkpoint_restore};
pub use project::{cmd_init, cmd_status};
pub use run::{cmd_run_stage, cmd_validate};
