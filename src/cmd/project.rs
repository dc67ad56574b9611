//! Project initialization and status commands.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use stagecraft::config::PipelineConfig;
use stagecraft::errors::PipelineError;
use stagecraft::orchestrator::Orchestrator;
use stagecraft::worker::ProcessWorker;

/// Build the orchestrator for one isolation root from its on-disk
/// configuration. The worker is only spawned by `run-stage`; the other
/// commands just need the shared wiring.
pub(crate) fn build_orchestrator(root: &Path) -> Result<Orchestrator<ProcessWorker>> {
    let config = PipelineConfig::load_or_default(root)?;
    let worker = ProcessWorker::new(
        config.worker.command.clone(),
        config.worker.args.clone(),
        root.to_path_buf(),
    );
    Ok(Orchestrator::new(root, config, worker))
}

pub fn cmd_init(root: &Path) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    let outcome = orchestrator.init_run()?;

    if outcome.created {
        println!("Initialized stagecraft run at {}", outcome.root.display());
        println!();
        println!("Created directory structure:");
        println!("  {}/", outcome.root.display());
        println!("  ├── stagecraft.toml   # Retry, worker, and gate thresholds");
        println!("  ├── state.json        # Run state, metric log, checkpoint index");
        println!("  ├── artifacts/        # Worker outputs, captured by checkpoints");
        println!("  ├── checkpoints/      # Restorable snapshots");
        println!("  ├── audit/            # Discarded-record trail");
        println!("  └── logs/             # Rolling orchestrator logs");
        println!();
        println!("Next steps:");
        println!("  1. Adjust gate thresholds in stagecraft.toml");
        println!("  2. Run `stagecraft run-stage` to execute the requirements stage");
    } else {
        println!(
            "Stagecraft run already initialized at {} (run {})",
            outcome.root.display(),
            outcome.run_id
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_status(root: &Path) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    match orchestrator.status() {
        Ok(doc) => {
            stagecraft::ui::print_status(&doc);
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::RunNotFound { path }) => {
            println!("Not initialized at {}. Run `stagecraft init` first.", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Err(e.into()),
    }
}
