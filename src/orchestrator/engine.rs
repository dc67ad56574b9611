//! The pipeline state machine.
//!
//! One orchestrator drives one run sequentially: stages never execute in
//! parallel within a run, since each stage's input is the prior stage's
//! validated output. `run_stage` performs exactly one transition attempt:
//!
//! ```text
//! load (corrupted -> restore from last checkpoint)
//!   -> validate inbound context
//!   -> worker call (retried with exponential backoff on transient failure)
//!   -> validate outbound payload
//!   -> evaluate quality gates
//!   -> commit: advance / block / abort
//! ```
//!
//! A gate block is a normal outcome, not an error: the run halts resumable,
//! and re-running the stage feeds the accumulated remediation notes back to
//! the worker. Cancellation is honored only between commits — a commit in
//! flight always completes.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

use crate::checkpoint::{ARTIFACTS_DIR, AUDIT_DIR, CHECKPOINTS_DIR, CheckpointManager};
use crate::config::PipelineConfig;
use crate::context::{ContextChain, ContextPayload, RawPayload};
use crate::errors::PipelineError;
use crate::gate::{GateResult, QualityGateEngine, QualityMetric};
use crate::stage::Stage;
use crate::store::{
    LoadOutcome, PipelineRun, RunStatus, StageOutcome, StageRecord, StateDocument, StateStore,
};
use crate::worker::{ProgressFn, RunMetadata, StageWorker, WorkerFailure, WorkerRequest};

/// Directory for rolling log files under the isolation root.
pub const LOGS_DIR: &str = "logs";

/// Result of one `run_stage` transition.
#[derive(Debug)]
pub enum StageAdvance {
    /// Gate allowed; the run moved to the next stage
    Advanced { from: Stage, to: Stage },
    /// Gate allowed on the final stage; the run is complete
    Completed { stage: Stage },
    /// Gate blocked; the run halts resumable with remediation attached
    Blocked { stage: Stage, gate: GateResult },
}

/// Result of `init_run`.
#[derive(Debug)]
pub struct InitOutcome {
    pub root: PathBuf,
    /// False when the root already held an initialized run
    pub created: bool,
    pub run_id: uuid::Uuid,
}

enum InvokeError {
    Failure(WorkerFailure),
    Cancelled,
}

/// Drives one pipeline run at one isolation root.
pub struct Orchestrator<W: StageWorker> {
    root: PathBuf,
    config: PipelineConfig,
    store: StateStore,
    chain: ContextChain,
    gates: QualityGateEngine,
    checkpoints: CheckpointManager,
    worker: W,
    cancel: Option<watch::Receiver<bool>>,
    progress: Option<ProgressFn>,
}

impl<W: StageWorker> Orchestrator<W> {
    pub fn new(root: &Path, config: PipelineConfig, worker: W) -> Self {
        let store = StateStore::new(root)
            .with_lock_timeout(Duration::from_millis(config.limits.lock_timeout_ms));
        let gates = QualityGateEngine::new(config.thresholds.clone());
        Self {
            root: root.to_path_buf(),
            store,
            chain: ContextChain::new(),
            gates,
            checkpoints: CheckpointManager::new(root),
            worker,
            config,
            cancel: None,
            progress: None,
        }
    }

    /// Honor an external cancellation signal: `true` on the channel aborts
    /// the run at the next safe point.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Receive worker progress messages (side-channel; never drives state).
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Scaffold the isolation root and create a fresh run if none exists.
    /// Idempotent: an initialized root is left untouched.
    pub fn init_run(&self) -> Result<InitOutcome, PipelineError> {
        for dir in [LOGS_DIR, ARTIFACTS_DIR, CHECKPOINTS_DIR, AUDIT_DIR] {
            let path = self.root.join(dir);
            std::fs::create_dir_all(&path)
                .map_err(|e| PipelineError::io(format!("creating {}", path.display()), e))?;
        }
        if !self.root.join(crate::config::CONFIG_FILE).exists() {
            PipelineConfig::starter().save(&self.root)?;
        }

        match self.store.load()? {
            LoadOutcome::Loaded(doc) => Ok(InitOutcome {
                root: self.root.clone(),
                created: false,
                run_id: doc.run.id,
            }),
            LoadOutcome::NotFound => {
                let doc = StateDocument::new(PipelineRun::new());
                let run_id = doc.run.id;
                self.store.commit(&doc)?;
                tracing::info!(root = %self.root.display(), %run_id, "initialized pipeline run");
                Ok(InitOutcome {
                    root: self.root.clone(),
                    created: true,
                    run_id,
                })
            }
            LoadOutcome::Corrupted { reason } => Err(PipelineError::StateCorrupted {
                path: self.store.state_path(),
                reason,
            }),
        }
    }

    /// The current state document, without side effects. Corruption is
    /// surfaced, not repaired — only `run_stage` auto-restores.
    pub fn status(&self) -> Result<StateDocument, PipelineError> {
        match self.store.load()? {
            LoadOutcome::Loaded(doc) => Ok(doc),
            LoadOutcome::NotFound => Err(PipelineError::RunNotFound {
                path: self.root.clone(),
            }),
            LoadOutcome::Corrupted { reason } => Err(PipelineError::StateCorrupted {
                path: self.store.state_path(),
                reason,
            }),
        }
    }

    /// Check configuration and recorded history without modifying anything.
    /// Returns human-readable findings; empty means clean.
    pub fn validate(&self) -> Result<Vec<String>, PipelineError> {
        let mut findings = self.config.validate();

        let doc = self.status()?;
        for (i, record) in doc.run.history.iter().enumerate() {
            if let Some(payload) = &record.context_out
                && let Err(e) = self.revalidate_output(record.stage, payload)
            {
                findings.push(format!(
                    "history[{}] ({}) has an invalid stored payload: {}",
                    i, record.stage, e
                ));
            }
        }
        for pair in doc.run.history.windows(2) {
            let ordered = pair[0].stage <= pair[1].stage;
            let remediation_reentry =
                pair[0].outcome == StageOutcome::Blocked && pair[1].stage == pair[0].stage;
            if !ordered && !remediation_reentry {
                findings.push(format!(
                    "history order violation: {} follows {}",
                    pair[1].stage, pair[0].stage
                ));
            }
        }
        Ok(findings)
    }

    fn revalidate_output(
        &self,
        stage: Stage,
        payload: &ContextPayload,
    ) -> Result<(), PipelineError> {
        let body = serde_json::Value::Object(
            payload
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self.chain.validate_outbound(
            stage,
            RawPayload {
                schema_version: payload.schema_version,
                body,
            },
        )?;
        Ok(())
    }

    /// Execute the current stage and commit the resulting transition.
    ///
    /// `expected` guards automation against racing another driver: when
    /// set, the run must currently be at that stage.
    pub async fn run_stage(
        &self,
        expected: Option<Stage>,
    ) -> Result<StageAdvance, PipelineError> {
        let mut doc = self.load_for_update()?;

        if doc.run.status.is_terminal() {
            return Err(PipelineError::RunClosed {
                status: doc.run.status,
            });
        }
        let stage = doc.run.current_stage;
        if let Some(expected) = expected
            && expected != stage
        {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "run is at stage {}, not {}",
                stage,
                expected
            )));
        }

        let context_in = self.inbound_context(&doc.run)?;
        let remediation = doc.run.remediation_notes(stage);
        if !remediation.is_empty() {
            tracing::info!(
                %stage,
                notes = remediation.len(),
                "re-entering blocked stage with remediation notes"
            );
        }

        let started_at = Utc::now();
        let max_attempts = self.config.retry.max_retries.max(1);
        let mut attempts = 0u32;

        let output = loop {
            attempts += 1;
            let request = WorkerRequest {
                stage,
                context_in: context_in.clone(),
                run: RunMetadata {
                    run_id: doc.run.id,
                    attempt: attempts,
                    remediation: remediation.clone(),
                },
            };

            match self.invoke_worker(&request).await {
                Ok(output) => break output,
                Err(InvokeError::Cancelled) => {
                    doc.run.status = RunStatus::Aborted;
                    doc.run.updated_at = Utc::now();
                    self.store.commit(&doc)?;
                    tracing::warn!(%stage, "run cancelled");
                    return Err(PipelineError::Cancelled { stage });
                }
                Err(InvokeError::Failure(failure)) => {
                    tracing::warn!(
                        %stage,
                        attempt = attempts,
                        kind = %failure.kind,
                        "worker attempt failed: {}",
                        failure.message
                    );
                    if attempts >= max_attempts {
                        doc.run.history.push(StageRecord {
                            stage,
                            started_at,
                            completed_at: Utc::now(),
                            context_in: context_in.clone(),
                            context_out: None,
                            gate_result: None,
                            outcome: StageOutcome::Failed,
                            attempts,
                            error: Some(failure.to_string()),
                        });
                        doc.run.status = RunStatus::Aborted;
                        doc.run.updated_at = Utc::now();
                        self.store.commit(&doc)?;
                        return Err(PipelineError::Worker {
                            kind: failure.kind,
                            message: failure.message,
                            attempts,
                        });
                    }
                    let factor = 1u64 << (attempts - 1).min(16);
                    let delay = Duration::from_millis(
                        self.config.retry.backoff_base_ms.saturating_mul(factor),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        // Validation failures are fatal to this operation and surfaced
        // verbatim; the run stays where it was, nothing is committed.
        let payload = self.chain.validate_outbound(stage, output.payload)?;

        let metrics: Vec<QualityMetric> = output
            .metrics
            .into_iter()
            .map(|reading| QualityMetric::from_reading(stage, reading))
            .collect();
        doc.append_metrics(&metrics);

        let gate = self.gates.evaluate(stage, &metrics);
        let outcome = if gate.allows() {
            StageOutcome::Passed
        } else {
            StageOutcome::Blocked
        };

        doc.run.history.push(StageRecord {
            stage,
            started_at,
            completed_at: Utc::now(),
            context_in,
            context_out: Some(payload),
            gate_result: Some(gate.clone()),
            outcome,
            attempts,
            error: None,
        });

        let advance = if gate.allows() {
            match stage.next() {
                Some(next) => {
                    doc.run.current_stage = next;
                    doc.run.status = RunStatus::Active;
                    StageAdvance::Advanced { from: stage, to: next }
                }
                None => {
                    doc.run.status = RunStatus::Completed;
                    StageAdvance::Completed { stage }
                }
            }
        } else {
            doc.run.status = RunStatus::Blocked;
            StageAdvance::Blocked { stage, gate }
        };

        doc.run.updated_at = Utc::now();
        self.store.commit(&doc)?;

        match &advance {
            StageAdvance::Advanced { from, to } => {
                tracing::info!(%from, %to, "stage passed, run advanced");
            }
            StageAdvance::Completed { stage } => {
                tracing::info!(%stage, "final stage passed, run completed");
            }
            StageAdvance::Blocked { stage, gate } => {
                tracing::warn!(
                    %stage,
                    remediation = gate.remediation.as_deref().unwrap_or(""),
                    "stage blocked by quality gate"
                );
            }
        }
        Ok(advance)
    }

    /// Load the state document, auto-restoring from the most recent
    /// compatible checkpoint when the file is corrupted.
    fn load_for_update(&self) -> Result<StateDocument, PipelineError> {
        match self.store.load()? {
            LoadOutcome::Loaded(doc) => Ok(doc),
            LoadOutcome::NotFound => Err(PipelineError::RunNotFound {
                path: self.root.clone(),
            }),
            LoadOutcome::Corrupted { reason } => {
                tracing::warn!(
                    path = %self.store.state_path().display(),
                    %reason,
                    "state file corrupted, attempting checkpoint restore"
                );
                let Some(latest) = self.checkpoints.latest_compatible() else {
                    return Err(PipelineError::StateCorrupted {
                        path: self.store.state_path(),
                        reason: format!("{} (no compatible checkpoint to restore)", reason),
                    });
                };
                let restored = self
                    .checkpoints
                    .restore(&self.store, &latest.id.to_string())?;
                Ok(restored)
            }
        }
    }

    /// The validated output of the previous stage, checked against the
    /// current stage's input contract. `None` for the entry stage.
    fn inbound_context(
        &self,
        run: &PipelineRun,
    ) -> Result<Option<ContextPayload>, PipelineError> {
        let stage = run.current_stage;
        if stage == Stage::first() {
            return Ok(None);
        }
        let Some(payload) = run.last_passed_output() else {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "stage {} has no validated output from a previous stage to consume",
                stage
            )));
        };
        let validated = self.chain.validate_inbound(stage, payload)?;
        Ok(Some(validated))
    }

    async fn invoke_worker(
        &self,
        request: &WorkerRequest,
    ) -> Result<crate::worker::WorkerOutput, InvokeError> {
        let Some(cancel) = &self.cancel else {
            return self
                .worker
                .invoke(request, self.progress.as_ref())
                .await
                .map_err(InvokeError::Failure);
        };

        let mut cancel = cancel.clone();
        if *cancel.borrow() {
            return Err(InvokeError::Cancelled);
        }
        let cancelled = async {
            // A dropped sender means no one can cancel anymore; keep going.
            if cancel.wait_for(|c| *c).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            out = self.worker.invoke(request, self.progress.as_ref()) => {
                out.map_err(InvokeError::Failure)
            }
            _ = cancelled => Err(InvokeError::Cancelled),
        }
    }
}
