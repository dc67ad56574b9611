use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "stagecraft")]
#[command(version, about = "Quality-gated V-Model pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Isolation root override. Falls back to $STAGECRAFT_ROOT, then
    /// ./.stagecraft
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the isolation root and start a fresh pipeline run
    Init,
    /// Show the current run, its stage history, and the last gate verdict
    Status,
    /// Execute the current stage and advance, block, or complete the run
    RunStage {
        /// Refuse to run unless the run is currently at this stage
        #[arg(long)]
        stage: Option<String>,
    },
    /// Check configuration and recorded state without modifying anything
    Validate,
    /// Manage restorable snapshots of state and artifacts
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Snapshot the current state and artifact tree
    Create {
        /// Label recorded with the checkpoint
        #[arg(short, long, default_value = "manual")]
        label: String,
    },
    /// List checkpoints known to the current run
    List,
    /// Rewind state and artifacts to a checkpoint (id or unique prefix)
    Restore { id: String },
}

fn init_tracing(verbose: bool, log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let default_filter = if verbose { "stagecraft=debug" } else { "stagecraft=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    // Rolling file logs once the root exists; before `init` there is
    // nowhere to write them.
    if let Some(dir) = log_dir.filter(|d| d.exists()) {
        let appender = tracing_appender::rolling::daily(dir, "stagecraft.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // run-stage is the one command allowed the documented fallback to a
    // user-scoped directory when the primary root is unwritable; everything
    // else surfaces the resolution error as-is.
    let root = match stagecraft::isolation::resolve_root(cli.root.as_deref()) {
        Ok(root) => root,
        Err(stagecraft::errors::PipelineError::PathResolution { path, reason })
            if matches!(cli.command, Commands::RunStage { .. }) =>
        {
            let fallback = stagecraft::isolation::fallback_root(&path);
            eprintln!(
                "warning: isolation root {} is not usable ({}); falling back to {}",
                path.display(),
                reason,
                fallback.display()
            );
            fallback
        }
        Err(e) => {
            return Err(anyhow::Error::from(e).context("Failed to resolve the isolation root"));
        }
    };
    let _log_guard = init_tracing(
        cli.verbose,
        Some(&root.join(stagecraft::orchestrator::engine::LOGS_DIR)),
    );

    let code = match &cli.command {
        Commands::Init => cmd::cmd_init(&root)?,
        Commands::Status => cmd::cmd_status(&root)?,
        Commands::RunStage { stage } => cmd::cmd_run_stage(&root, stage.as_deref()).await?,
        Commands::Validate => cmd::cmd_validate(&root)?,
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Create { label } => cmd::cmd_checkpoint_create(&root, label)?,
            CheckpointCommands::List => cmd::cmd_checkpoint_list(&root)?,
            CheckpointCommands::Restore { id } => cmd::cmd_checkpoint_restore(&root, id)?,
        },
    };
    Ok(code)
}
