//! Terminal output for the stagecraft CLI.
//!
//! A thin layer over `console` styling and an `indicatif` spinner for the
//! outstanding worker call. Core modules never print; everything
//! user-facing funnels through here or through plain `println!` in the
//! command handlers.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::gate::GateResult;
use crate::stage::Stage;
use crate::store::{StageOutcome, StateDocument};

/// Spinner shown while the stage worker is running.
pub struct WorkerSpinner {
    bar: ProgressBar,
}

impl WorkerSpinner {
    pub fn start(stage: Stage) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.bold.dim} {spinner} {msg}")
                .expect("spinner template is a valid static string"),
        );
        bar.set_prefix(format!("{}", stage));
        bar.set_message("worker running...");
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Surface a worker progress message on the spinner line.
    pub fn progress(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Print the header line before a stage executes.
pub fn print_stage_header(stage: Stage, attempt_notes: usize) {
    println!();
    println!(
        "{} {}",
        style("Running stage").bold(),
        style(stage).cyan().bold()
    );
    if attempt_notes > 0 {
        println!(
            "  {} {} remediation note(s) from prior blocked attempts",
            style("↻").yellow(),
            attempt_notes
        );
    }
}

/// Print a gate verdict with its per-threshold detail.
pub fn print_gate_result(gate: &GateResult) {
    if gate.allows() {
        println!("  {} quality gate passed", style("✓").green());
    } else {
        println!("  {} quality gate blocked", style("✗").red().bold());
    }
    for check in &gate.checks {
        let mark = if check.passed {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let actual = check
            .actual
            .map(|v| v.to_string())
            .unwrap_or_else(|| "not reported".to_string());
        println!(
            "    {} {} {} (actual: {})",
            mark, check.metric, check.threshold, actual
        );
    }
    if let Some(remediation) = &gate.remediation {
        println!("  {} {}", style("remediation:").yellow().bold(), remediation);
    }
}

/// Print the run summary for `stagecraft status`.
pub fn print_status(doc: &StateDocument) {
    let run = &doc.run;
    println!("{} {}", style("Run").bold(), run.id);
    println!("  status:  {}", style(run.status).bold());
    println!("  stage:   {}", style(run.current_stage).cyan());
    println!("  started: {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  updated: {}", run.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if run.history.is_empty() {
        println!("  history: (no stage records yet)");
        return;
    }

    println!("  history:");
    for record in &run.history {
        let (mark, label) = match record.outcome {
            StageOutcome::Passed => (style("✓").green(), "passed"),
            StageOutcome::Blocked => (style("⊘").yellow(), "blocked"),
            StageOutcome::Failed => (style("✗").red(), "failed"),
        };
        let mut line = format!(
            "    {} {:<13} {} ({} attempt(s))",
            mark, record.stage, label, record.attempts
        );
        if let Some(error) = &record.error {
            line.push_str(&format!(" — {}", error));
        }
        println!("{}", line);
    }

    if let Some(last) = run.last_record()
        && let Some(gate) = &last.gate_result
        && let Some(remediation) = &gate.remediation
    {
        println!("  last gate: {}", remediation);
    }

    if !doc.checkpoints.is_empty() {
        println!("  checkpoints: {}", doc.checkpoints.len());
    }
}
