use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "guideforge")]
#[command(version, about = "Build and refine model guidelines against an evaluation oracle")]
pub struct Cli {
    /// Target (model) whose guidelines are built
    #[arg(short, long, global = true, env = "GUIDEFORGE_TARGET")]
    pub target: Option<String>,

    /// Directory holding guideforge.toml and the .guideforge state directory
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the guidelines until the evals pass, then simplify them
    Run {
        /// Regex restricting which evals the oracle runs
        #[arg(long)]
        test_filter: Option<String>,

        /// Stop after construction
        #[arg(long)]
        skip_refinement: bool,
    },
    /// Show the live status of the target
    Status,
    /// List past runs, most recent first
    History,
    /// Delete old run directories
    Clean {
        /// Number of most recent runs to keep
        #[arg(long, default_value = "5")]
        keep: usize,
    },
    /// Print the committed guidelines
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let base_dir = match cli.base_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let target = cmd::target_config(cli.target.as_deref(), base_dir)?;

    let log_dir = matches!(cli.command, Commands::Run { .. }).then(|| target.log_dir());
    let _guard = guideforge::logging::init(cli.verbose, cli.json, log_dir.as_deref())?;

    match &cli.command {
        Commands::Run {
            test_filter,
            skip_refinement,
        } => cmd::cmd_run(target, test_filter.clone(), *skip_refinement).await?,
        Commands::Status => cmd::cmd_status(&target, cli.json)?,
        Commands::History => cmd::cmd_history(&target)?,
        Commands::Clean { keep } => cmd::cmd_clean(&target, *keep)?,
        Commands::Show => cmd::cmd_show(&target)?,
    }

    Ok(())
}
