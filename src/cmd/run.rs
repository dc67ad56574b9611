//! Stage execution and validation — `stagecraft run-stage` and
//! `stagecraft validate`.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use stagecraft::orchestrator::StageAdvance;
use stagecraft::stage::Stage;
use stagecraft::ui::{self, WorkerSpinner};
use stagecraft::worker::ProgressFn;

use super::project::build_orchestrator;

pub async fn cmd_run_stage(root: &Path, expected: Option<&str>) -> Result<ExitCode> {
    let expected = expected.map(|s| s.parse::<Stage>()).transpose()?;

    let orchestrator = build_orchestrator(root)?;
    let doc = orchestrator.status()?;
    let stage = doc.run.current_stage;
    ui::print_stage_header(stage, doc.run.remediation_notes(stage).len());

    let spinner = Arc::new(WorkerSpinner::start(stage));
    let spinner_for_progress = spinner.clone();
    let progress: ProgressFn = Arc::new(move |message: &str| {
        spinner_for_progress.progress(message);
    });

    let orchestrator = orchestrator.with_progress(progress);
    let advance = orchestrator.run_stage(expected).await;
    spinner.finish();

    match advance? {
        StageAdvance::Advanced { from, to } => {
            println!(
                "  {} stage {} passed; run advanced to {}",
                console::style("✓").green(),
                from,
                to
            );
            Ok(ExitCode::SUCCESS)
        }
        StageAdvance::Completed { stage } => {
            println!(
                "  {} stage {} passed; pipeline completed",
                console::style("✓").green().bold(),
                stage
            );
            Ok(ExitCode::SUCCESS)
        }
        StageAdvance::Blocked { stage, gate } => {
            ui::print_gate_result(&gate);
            println!(
                "  run halted at {}; fix the findings and re-run `stagecraft run-stage`",
                stage
            );
            Ok(ExitCode::from(2))
        }
    }
}

pub fn cmd_validate(root: &Path) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(root)?;
    let findings = orchestrator.validate()?;

    if findings.is_empty() {
        println!(
            "{} configuration and recorded state are valid",
            console::style("✓").green()
        );
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "{} validation found {} issue(s):",
            console::style("✗").red(),
            findings.len()
        );
        for finding in &findings {
            println!("  - {}", finding);
        }
        Ok(ExitCode::FAILURE)
    }
}
