//! Typed error hierarchy for the stagecraft orchestrator.
//!
//! Two top-level enums cover the pipeline core:
//! - `ValidationError` — context schema/contract violations, including
//!   failed or missing payload migrations
//! - `PipelineError` — everything else the orchestration core can surface
//!
//! A quality-gate block is deliberately *not* an error: the orchestrator
//! reports it as a normal `StageAdvance::Blocked` outcome carrying the
//! `GateResult`, and the CLI maps it to exit code 2.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::context::FieldKind;
use crate::stage::Stage;
use crate::store::RunStatus;

/// Context payload contract violations. Always surfaced verbatim, never
/// coerced into a retry or a silent default.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("stage {stage} payload is missing required field '{field}'")]
    MissingField { stage: Stage, field: String },

    #[error(
        "stage {stage} payload field '{field}' has the wrong kind: expected {expected}, got {actual}"
    )]
    WrongKind {
        stage: Stage,
        field: String,
        expected: FieldKind,
        actual: String,
    },

    #[error("payload was produced for stage {found} but stage {expected} was expected")]
    StageMismatch { expected: Stage, found: Stage },

    #[error("payload body must be a JSON object, got {actual}")]
    NotAnObject { actual: String },

    #[error("no migration path from context schema version {from} to {to}")]
    UnmigratableContext { from: u32, to: u32 },

    #[error("context migration {from} -> {to} failed: {message}")]
    MigrationFailed { from: u32, to: u32, message: String },
}

/// Errors from the orchestration core.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("isolation root {path} is not usable: {reason}")]
    PathResolution { path: PathBuf, reason: String },

    #[error("isolation root {path} is already owned by an active scope")]
    ScopeBusy { path: PathBuf },

    #[error("could not acquire the state lock at {path} within {timeout_ms}ms")]
    LockTimeout { path: PathBuf, timeout_ms: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("worker failed after {attempts} attempt(s): [{kind}] {message}")]
    Worker {
        kind: String,
        message: String,
        attempts: u32,
    },

    #[error("run cancelled during stage {stage}; committed records are preserved")]
    Cancelled { stage: Stage },

    #[error("state file at {path} is corrupted: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    #[error(
        "checkpoint {id} was written with schema version {found}, incompatible with current version {current}"
    )]
    IncompatibleCheckpoint { id: Uuid, found: u32, current: u32 },

    #[error("checkpoint {id} not found")]
    CheckpointNotFound { id: String },

    #[error("no pipeline run at {path}; run 'stagecraft init' first")]
    RunNotFound { path: PathBuf },

    #[error("run is {status} and accepts no further transitions")]
    RunClosed { status: RunStatus },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Wrap an io error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Worker { .. })
    }
}
