//! The external stage-worker boundary.
//!
//! A worker consumes `{stage, context_in, run metadata}` and produces either
//! a raw context payload plus metric readings or a structured failure. Its
//! internal reasoning is opaque to the orchestrator.
//!
//! `ProcessWorker` is the production implementation: it spawns the
//! configured command, writes the request as JSON to the child's stdin, and
//! reads newline-delimited JSON events from stdout. `progress` events are a
//! side-channel surfaced to the caller's notifier; they never advance the
//! state machine — only the terminal `result` event does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::context::{CONTEXT_SCHEMA_VERSION, ContextPayload, RawPayload};
use crate::gate::MetricReading;
use crate::stage::Stage;

/// Structured failure from a worker invocation. Transient by contract: the
/// orchestrator retries per its configured policy before aborting.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{kind}] {message}")]
pub struct WorkerFailure {
    pub kind: String,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Run metadata handed to the worker alongside the stage context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    /// 1-based invocation counter within the current stage attempt
    pub attempt: u32,
    /// Remediation notes from prior blocked attempts of this stage
    #[serde(default)]
    pub remediation: Vec<String>,
}

/// The document written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_in: Option<ContextPayload>,
    pub run: RunMetadata,
}

/// Successful worker output: the unvalidated payload and metric readings.
#[derive(Debug)]
pub struct WorkerOutput {
    pub payload: RawPayload,
    pub metrics: Vec<MetricReading>,
}

/// Events from the worker's NDJSON stdout stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Incremental progress text; informational only
    Progress { message: String },
    /// Terminal success event
    Result {
        #[serde(default = "current_schema_version")]
        schema_version: u32,
        context_out: serde_json::Value,
        #[serde(default)]
        metrics: Vec<MetricReading>,
    },
    /// Terminal failure event
    Error { kind: String, message: String },
}

fn current_schema_version() -> u32 {
    CONTEXT_SCHEMA_VERSION
}

/// Callback receiving worker progress messages.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// The external collaborator that performs stage-specific reasoning.
///
/// Implementations must be cancel-safe: dropping the returned future must
/// release the underlying resource (the process worker kills its child).
#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn invoke(
        &self,
        request: &WorkerRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<WorkerOutput, WorkerFailure>;
}

/// Production worker backed by a spawned subprocess.
pub struct ProcessWorker {
    command: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl ProcessWorker {
    pub fn new(command: impl Into<String>, args: Vec<String>, workdir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            workdir,
        }
    }
}

#[async_trait]
impl StageWorker for ProcessWorker {
    async fn invoke(
        &self,
        request: &WorkerRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<WorkerOutput, WorkerFailure> {
        let request_json = serde_json::to_string(request)
            .map_err(|e| WorkerFailure::new("serialize", e.to_string()))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerFailure::new("spawn", format!("{}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request_json.as_bytes())
                .await
                .map_err(|e| WorkerFailure::new("stdin", e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| WorkerFailure::new("stdin", e.to_string()))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerFailure::new("stdout", "failed to capture worker stdout"))?;
        let mut reader = BufReader::new(stdout).lines();

        let mut terminal: Option<Result<WorkerOutput, WorkerFailure>> = None;

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| WorkerFailure::new("stream", e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerEvent>(&line) {
                Ok(WorkerEvent::Progress { message }) => {
                    if let Some(notify) = progress {
                        notify(&message);
                    }
                }
                Ok(WorkerEvent::Result {
                    schema_version,
                    context_out,
                    metrics,
                }) => {
                    terminal = Some(Ok(WorkerOutput {
                        payload: RawPayload {
                            schema_version,
                            body: context_out,
                        },
                        metrics,
                    }));
                }
                Ok(WorkerEvent::Error { kind, message }) => {
                    terminal = Some(Err(WorkerFailure { kind, message }));
                }
                Err(_) => {
                    // Workers are free to chat on stdout; only well-formed
                    // events participate in the protocol.
                    tracing::debug!(line, "ignoring non-event worker output");
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| WorkerFailure::new("wait", e.to_string()))?;

        match terminal {
            Some(Ok(output)) if status.success() => Ok(output),
            Some(Err(failure)) => Err(failure),
            Some(Ok(_)) => Err(WorkerFailure::new(
                "exit",
                format!(
                    "worker emitted a result but exited with code {}",
                    status.code().unwrap_or(-1)
                ),
            )),
            None => Err(WorkerFailure::new(
                "protocol",
                format!(
                    "worker exited with code {} without a terminal event",
                    status.code().unwrap_or(-1)
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn request() -> WorkerRequest {
        WorkerRequest {
            stage: Stage::Requirements,
            context_in: None,
            run: RunMetadata {
                run_id: Uuid::new_v4(),
                attempt: 1,
                remediation: Vec::new(),
            },
        }
    }

    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_event_parsing() {
        let event: WorkerEvent =
            serde_json::from_str(r#"{"type":"progress","message":"thinking"}"#).unwrap();
        assert!(matches!(event, WorkerEvent::Progress { .. }));

        let event: WorkerEvent = serde_json::from_str(
            r#"{"type":"result","context_out":{"summary":"s"},"metrics":[{"name":"coverage","value":85.0}]}"#,
        )
        .unwrap();
        match event {
            WorkerEvent::Result {
                schema_version,
                metrics,
                ..
            } => {
                assert_eq!(schema_version, CONTEXT_SCHEMA_VERSION);
                assert_eq!(metrics.len(), 1);
                assert_eq!(metrics[0].name, "coverage");
            }
            other => panic!("Expected Result, got {other:?}"),
        }

        let event: WorkerEvent =
            serde_json::from_str(r#"{"type":"error","kind":"transient","message":"503"}"#).unwrap();
        assert!(matches!(event, WorkerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_process_worker_success() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"progress","message":"working"}'
echo '{"type":"result","context_out":{"summary":"done","requirements":[],"acceptance_criteria":[]},"metrics":[{"name":"coverage","value":90.0}]}'"#,
        );

        let worker = ProcessWorker::new(
            script.to_string_lossy().to_string(),
            vec![],
            dir.path().to_path_buf(),
        );

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let notify: ProgressFn = Arc::new(move |msg: &str| {
            seen_clone.lock().unwrap().push(msg.to_string());
        });

        let output = worker.invoke(&request(), Some(&notify)).await.unwrap();
        assert_eq!(output.metrics.len(), 1);
        assert_eq!(
            output.payload.body.get("summary"),
            Some(&json!("done"))
        );
        assert_eq!(seen.lock().unwrap().as_slice(), ["working"]);
    }

    #[tokio::test]
    async fn test_process_worker_error_event() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"error","kind":"transient","message":"upstream 503"}'"#,
        );

        let worker = ProcessWorker::new(
            script.to_string_lossy().to_string(),
            vec![],
            dir.path().to_path_buf(),
        );
        let failure = worker.invoke(&request(), None).await.unwrap_err();
        assert_eq!(failure.kind, "transient");
        assert!(failure.message.contains("503"));
    }

    #[tokio::test]
    async fn test_process_worker_no_terminal_event() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\necho 'plain chatter'");

        let worker = ProcessWorker::new(
            script.to_string_lossy().to_string(),
            vec![],
            dir.path().to_path_buf(),
        );
        let failure = worker.invoke(&request(), None).await.unwrap_err();
        assert_eq!(failure.kind, "protocol");
    }

    #[tokio::test]
    async fn test_process_worker_spawn_failure() {
        let dir = tempdir().unwrap();
        let worker = ProcessWorker::new(
            "/nonexistent/worker-binary",
            vec![],
            dir.path().to_path_buf(),
        );
        let failure = worker.invoke(&request(), None).await.unwrap_err();
        assert_eq!(failure.kind, "spawn");
    }

    #[tokio::test]
    async fn test_process_worker_nonzero_exit_with_result() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"result","context_out":{}}'
exit 3"#,
        );

        let worker = ProcessWorker::new(
            script.to_string_lossy().to_string(),
            vec![],
            dir.path().to_path_buf(),
        );
        let failure = worker.invoke(&request(), None).await.unwrap_err();
        assert_eq!(failure.kind, "exit");
        assert!(failure.message.contains("3"));
    }
}
