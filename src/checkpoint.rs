//! Restorable snapshots of pipeline state and artifacts.
//!
//! A checkpoint pairs the state document at creation time with a
//! content-addressed manifest of the artifact tree. Artifact bytes are
//! stored once per digest under `checkpoints/objects/`; a file unchanged
//! since an earlier checkpoint is referenced, not duplicated.
//!
//! Restore is destructive to the *current* state of the root: the state
//! file is rewritten from the snapshot and the artifact tree is rebuilt
//! from the object store. Stage records discarded by the rewind are
//! appended to `audit/discarded.jsonl` first, so the full history survives
//! in the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::PipelineError;
use crate::store::{
    CheckpointMeta, LoadOutcome, STATE_SCHEMA_VERSION, StageRecord, StateDocument, StateStore,
};

/// Directory names under the isolation root.
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const OBJECTS_DIR: &str = "objects";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const AUDIT_DIR: &str = "audit";
const DISCARDED_FILE: &str = "discarded.jsonl";

/// One artifact file captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the artifacts directory, with `/` separators
    pub path: String,
    /// Hex sha256 of the file contents; the object store key
    pub digest: String,
    pub len: u64,
}

/// The full snapshot persisted per checkpoint under `checkpoints/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub meta: CheckpointMeta,
    pub state: StateDocument,
    pub artifacts: Vec<ArtifactEntry>,
}

/// A record retained in the audit trail after a restore discarded it from
/// the active run.
#[derive(Debug, Serialize, Deserialize)]
struct DiscardedRecord {
    discarded_at: DateTime<Utc>,
    checkpoint_id: Uuid,
    record: StageRecord,
}

/// Creates, lists, and restores checkpoints for one isolation root.
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }

    fn objects_dir(&self) -> PathBuf {
        self.checkpoints_dir().join(OBJECTS_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_DIR).join(DISCARDED_FILE)
    }

    fn manifest_path(&self, id: Uuid) -> PathBuf {
        self.checkpoints_dir().join(format!("{}.json", id))
    }

    /// Snapshot the current state document and artifact tree.
    pub fn create(
        &self,
        store: &StateStore,
        label: &str,
    ) -> Result<CheckpointMeta, PipelineError> {
        let mut doc = match store.load()? {
            LoadOutcome::Loaded(doc) => doc,
            LoadOutcome::NotFound => {
                return Err(PipelineError::RunNotFound {
                    path: store.root().to_path_buf(),
                });
            }
            LoadOutcome::Corrupted { reason } => {
                return Err(PipelineError::StateCorrupted {
                    path: store.state_path(),
                    reason,
                });
            }
        };

        let artifacts = self.snapshot_artifacts()?;

        let meta = CheckpointMeta {
            id: Uuid::new_v4(),
            label: label.to_string(),
            created_at: Utc::now(),
            schema_version: doc.schema_version,
            stage: doc.run.current_stage,
        };

        // The embedded state is the document as it stood before this
        // checkpoint was indexed, so a manifest never references itself.
        let manifest = CheckpointManifest {
            meta: meta.clone(),
            state: doc.clone(),
            artifacts,
        };

        fs::create_dir_all(self.checkpoints_dir()).map_err(|e| {
            PipelineError::io(format!("creating {}", self.checkpoints_dir().display()), e)
        })?;
        let path = self.manifest_path(meta.id);
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("serializing checkpoint: {}", e)))?;
        fs::write(&path, json)
            .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))?;

        doc.checkpoints.push(meta.clone());
        store.commit(&doc)?;

        tracing::debug!(id = %meta.id, label = %meta.label, stage = %meta.stage, "checkpoint created");
        Ok(meta)
    }

    /// The checkpoint index of the current state document.
    pub fn list(&self, store: &StateStore) -> Result<Vec<CheckpointMeta>, PipelineError> {
        match store.load()? {
            LoadOutcome::Loaded(doc) => Ok(doc.checkpoints),
            LoadOutcome::NotFound => Err(PipelineError::RunNotFound {
                path: store.root().to_path_buf(),
            }),
            LoadOutcome::Corrupted { reason } => Err(PipelineError::StateCorrupted {
                path: store.state_path(),
                reason,
            }),
        }
    }

    /// Restore the root to `id` (a full UUID or unique prefix).
    ///
    /// Returns the restored state document after committing it.
    pub fn restore(
        &self,
        store: &StateStore,
        id: &str,
    ) -> Result<StateDocument, PipelineError> {
        let manifest = self.find_manifest(id)?;

        if manifest.meta.schema_version != STATE_SCHEMA_VERSION {
            return Err(PipelineError::IncompatibleCheckpoint {
                id: manifest.meta.id,
                found: manifest.meta.schema_version,
                current: STATE_SCHEMA_VERSION,
            });
        }

        // Retain the rewound tail in the audit trail before overwriting.
        let current = store.load()?;
        let mut restored = manifest.state.clone();
        if let LoadOutcome::Loaded(current) = current {
            let snapshot_len = manifest.state.run.history.len();
            if current.run.id == manifest.state.run.id
                && current.run.history.len() > snapshot_len
            {
                self.audit_discarded(manifest.meta.id, &current.run.history[snapshot_len..])?;
            }
            // Checkpoints created after this snapshot stay addressable.
            restored.checkpoints = current.checkpoints;
        }

        self.restore_artifacts(&manifest.artifacts)?;
        store.commit(&restored)?;

        tracing::info!(
            id = %manifest.meta.id,
            stage = %restored.run.current_stage,
            "restored from checkpoint"
        );
        Ok(restored)
    }

    /// Most recent checkpoint with a compatible schema version, read from
    /// the manifests on disk. Used for recovery when the state document
    /// itself is unreadable.
    pub fn latest_compatible(&self) -> Option<CheckpointMeta> {
        let dir = self.checkpoints_dir();
        let entries = fs::read_dir(&dir).ok()?;
        let mut best: Option<CheckpointMeta> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<CheckpointManifest>(&content) else {
                continue;
            };
            if manifest.meta.schema_version != STATE_SCHEMA_VERSION {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|b| manifest.meta.created_at > b.created_at)
            {
                best = Some(manifest.meta);
            }
        }
        best
    }

    fn find_manifest(&self, id: &str) -> Result<CheckpointManifest, PipelineError> {
        let dir = self.checkpoints_dir();
        let entries = fs::read_dir(&dir).map_err(|_| PipelineError::CheckpointNotFound {
            id: id.to_string(),
        })?;

        let mut matches = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with(id) {
                matches.push(path);
            }
        }

        match matches.as_slice() {
            [path] => {
                let content = fs::read_to_string(path)
                    .map_err(|e| PipelineError::io(format!("reading {}", path.display()), e))?;
                serde_json::from_str(&content).map_err(|e| {
                    PipelineError::Other(anyhow::anyhow!(
                        "checkpoint manifest {} is unreadable: {}",
                        path.display(),
                        e
                    ))
                })
            }
            [] => Err(PipelineError::CheckpointNotFound {
                id: id.to_string(),
            }),
            _ => Err(PipelineError::Other(anyhow::anyhow!(
                "checkpoint id '{}' is ambiguous ({} matches)",
                id,
                matches.len()
            ))),
        }
    }

    /// Hash every artifact file into the object store, skipping objects
    /// that already exist.
    fn snapshot_artifacts(&self) -> Result<Vec<ArtifactEntry>, PipelineError> {
        let artifacts_dir = self.artifacts_dir();
        if !artifacts_dir.exists() {
            return Ok(Vec::new());
        }
        let objects_dir = self.objects_dir();
        fs::create_dir_all(&objects_dir)
            .map_err(|e| PipelineError::io(format!("creating {}", objects_dir.display()), e))?;

        let mut entries = Vec::new();
        for entry in WalkDir::new(&artifacts_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                PipelineError::Other(anyhow::anyhow!("walking artifact tree: {}", e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let bytes = fs::read(path)
                .map_err(|e| PipelineError::io(format!("reading {}", path.display()), e))?;
            let digest = hex_digest(&bytes);

            let object_path = objects_dir.join(&digest);
            if !object_path.exists() {
                fs::write(&object_path, &bytes).map_err(|e| {
                    PipelineError::io(format!("writing {}", object_path.display()), e)
                })?;
            }

            let relative = path
                .strip_prefix(&artifacts_dir)
                .expect("walkdir yields paths under its root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push(ArtifactEntry {
                path: relative,
                digest,
                len: bytes.len() as u64,
            });
        }
        Ok(entries)
    }

    /// Rebuild the artifact tree exactly as the manifest describes it.
    fn restore_artifacts(&self, entries: &[ArtifactEntry]) -> Result<(), PipelineError> {
        let artifacts_dir = self.artifacts_dir();
        if artifacts_dir.exists() {
            fs::remove_dir_all(&artifacts_dir).map_err(|e| {
                PipelineError::io(format!("clearing {}", artifacts_dir.display()), e)
            })?;
        }
        fs::create_dir_all(&artifacts_dir)
            .map_err(|e| PipelineError::io(format!("creating {}", artifacts_dir.display()), e))?;

        let objects_dir = self.objects_dir();
        for entry in entries {
            let object_path = objects_dir.join(&entry.digest);
            let target = artifacts_dir.join(&entry.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::io(format!("creating {}", parent.display()), e)
                })?;
            }
            fs::copy(&object_path, &target).map_err(|e| {
                PipelineError::io(
                    format!(
                        "restoring {} from object {}",
                        target.display(),
                        entry.digest
                    ),
                    e,
                )
            })?;
        }
        Ok(())
    }

    fn audit_discarded(
        &self,
        checkpoint_id: Uuid,
        records: &[StageRecord],
    ) -> Result<(), PipelineError> {
        let path = self.audit_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelineError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::io(format!("opening {}", path.display()), e))?;
        let now = Utc::now();
        for record in records {
            let line = serde_json::to_string(&DiscardedRecord {
                discarded_at: now,
                checkpoint_id,
                record: record.clone(),
            })
            .map_err(|e| {
                PipelineError::Other(anyhow::anyhow!("serializing audit record: {}", e))
            })?;
            writeln!(file, "{}", line)
                .map_err(|e| PipelineError::io(format!("appending {}", path.display()), e))?;
        }
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
