//! Checkpoint management — `stagecraft checkpoint create|list|restore`.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use super::project::build_orchestrator;

pub fn cmd_checkpoint_create(root: &Path, label: &str) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    let meta = orchestrator
        .checkpoints()
        .create(orchestrator.store(), label)?;
    println!(
        "Created checkpoint {} ('{}') at stage {}",
        meta.id, meta.label, meta.stage
    );
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_checkpoint_list(root: &Path) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    let checkpoints = orchestrator.checkpoints().list(orchestrator.store())?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return Ok(ExitCode::SUCCESS);
    }
    for meta in checkpoints {
        println!(
            "{}  {}  {:<13} {}",
            meta.id,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            meta.stage.to_string(),
            meta.label
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_checkpoint_restore(root: &Path, id: &str) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    let restored = orchestrator.checkpoints().restore(orchestrator.store(), id)?;
    println!(
        "Restored run {} to stage {}; discarded records retained in the audit trail",
        restored.run.id, restored.run.current_stage
    );
    Ok(ExitCode::SUCCESS)
}
