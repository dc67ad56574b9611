//! Durable pipeline state, keyed by the run's isolation root.
//!
//! One JSON document per root (`state.json`) holds the serialized run, the
//! metric log, and the checkpoint index. Commits are atomic: the document is
//! written to a sidecar temp file, fsynced, then renamed over the old state,
//! so a crash mid-write never leaves a half-written file behind. Writers to
//! the same root are serialized through an advisory `fs2` lock with a
//! bounded acquisition timeout.
//!
//! `load` never panics past the boundary: a missing file is `NotFound`, an
//! unreadable or unparsable one is `Corrupted` — the orchestrator, not the
//! store, decides whether a corrupted state triggers a checkpoint restore.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::ContextPayload;
use crate::errors::PipelineError;
use crate::gate::{GateResult, QualityMetric};
use crate::stage::Stage;

/// Version of the persisted state document. A checkpoint written at a
/// different version cannot be restored.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// State document filename under the isolation root.
pub const STATE_FILE: &str = "state.json";

/// Sidecar lock filename under the isolation root.
pub const LOCK_FILE: &str = "state.lock";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is progressing normally
    #[default]
    Active,
    /// Halted by a quality gate; resumable after remediation
    Blocked,
    /// All stages passed
    Completed,
    /// Terminal failure; a new run must be started
    Aborted,
}

impl RunStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Active => "active",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Passed,
    Blocked,
    Failed,
}

/// One entry of the run history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_in: Option<ContextPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_out: Option<ContextPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateResult>,
    pub outcome: StageOutcome,
    /// Worker invocations for this record, including transient retries
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One sprint/story execution. Owned by the orchestrator; mutated only
/// through its advance/block/abort paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub current_stage: Stage,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only; a checkpoint restore truncates it, retaining the
    /// discarded tail in the audit trail
    pub history: Vec<StageRecord>,
}

impl PipelineRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            current_stage: Stage::first(),
            status: RunStatus::Active,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn last_record(&self) -> Option<&StageRecord> {
        self.history.last()
    }

    /// The validated output of the most recent passed stage, which is the
    /// inbound context for the current stage.
    pub fn last_passed_output(&self) -> Option<&ContextPayload> {
        self.history
            .iter()
            .rev()
            .find(|r| r.outcome == StageOutcome::Passed)
            .and_then(|r| r.context_out.as_ref())
    }

    /// Remediation notes accumulated from blocked attempts of `stage`,
    /// oldest first. Fed back to the worker when the stage is re-entered.
    pub fn remediation_notes(&self, stage: Stage) -> Vec<String> {
        self.history
            .iter()
            .filter(|r| r.stage == stage && r.outcome == StageOutcome::Blocked)
            .filter_map(|r| r.gate_result.as_ref())
            .filter_map(|g| g.remediation.clone())
            .collect()
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// A metric appended to the run's metric log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub stage: Stage,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn from_metric(metric: &QualityMetric) -> Self {
        Self {
            name: metric.name.clone(),
            stage: metric.stage_produced,
            value: metric.value,
            unit: metric.unit.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Entry of the checkpoint index embedded in the state document. The full
/// snapshot lives in its own manifest file under `checkpoints/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    /// Stage the run was at when the snapshot was taken
    pub stage: Stage,
}

/// The single JSON document persisted per isolation root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema_version: u32,
    pub run: PipelineRun,
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointMeta>,
}

impl StateDocument {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run,
            metrics: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Append metrics to the log. One-shot entries; never mutated after.
    pub fn append_metrics(&mut self, metrics: &[QualityMetric]) {
        self.metrics
            .extend(metrics.iter().map(MetricRecord::from_metric));
    }
}

/// Result of reading the state document.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(StateDocument),
    NotFound,
    Corrupted { reason: String },
}

/// Durable, atomically-committed persistence of the state document.
pub struct StateStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Read the current state document.
    ///
    /// Readers do not take the advisory lock: commits replace the file
    /// atomically, so a read sees either the prior or the new document.
    pub fn load(&self) -> Result<LoadOutcome, PipelineError> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadOutcome::NotFound);
            }
            Err(e) => {
                return Ok(LoadOutcome::Corrupted {
                    reason: format!("unreadable: {}", e),
                });
            }
        };

        let doc: StateDocument = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                return Ok(LoadOutcome::Corrupted {
                    reason: format!("invalid JSON: {}", e),
                });
            }
        };

        if doc.schema_version != STATE_SCHEMA_VERSION {
            return Ok(LoadOutcome::Corrupted {
                reason: format!(
                    "unsupported state schema version {} (current {})",
                    doc.schema_version, STATE_SCHEMA_VERSION
                ),
            });
        }

        Ok(LoadOutcome::Loaded(doc))
    }

    /// Atomically persist the document, serialized under the advisory lock.
    pub fn commit(&self, doc: &StateDocument) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| PipelineError::io(format!("creating {}", self.root.display()), e))?;

        let _guard = self.acquire_lock()?;

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("serializing state: {}", e)))?;

        let path = self.state_path();
        let tmp = self.root.join(format!("{}.tmp", STATE_FILE));
        {
            let mut file = File::create(&tmp)
                .map_err(|e| PipelineError::io(format!("creating {}", tmp.display()), e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| PipelineError::io(format!("writing {}", tmp.display()), e))?;
            file.sync_all()
                .map_err(|e| PipelineError::io(format!("syncing {}", tmp.display()), e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| {
            PipelineError::io(format!("replacing {}", path.display()), e)
        })?;

        tracing::debug!(path = %path.display(), stage = %doc.run.current_stage, "state committed");
        Ok(())
    }

    /// Acquire the advisory writer lock, polling until the timeout elapses.
    fn acquire_lock(&self) -> Result<LockGuard, PipelineError> {
        let path = self.lock_path();
        let file = File::create(&path)
            .map_err(|e| PipelineError::io(format!("creating {}", path.display()), e))?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(_) => {
                    return Err(PipelineError::LockTimeout {
                        path,
                        timeout_ms: self.lock_timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}

/// Holds the advisory lock for the duration of one commit.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Released implicitly when the descriptor closes; unlock explicitly
        // so the release is not deferred by a lingering handle.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
