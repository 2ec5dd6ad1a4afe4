//! Agent sandbox CLI library

pub mod context;
pub mod result;
pub mod session;

use anyhow::Result;
use std::path::PathBuf;

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

pub use context::CliContext;

#[derive(Parser)]
#[command(name = "ags")]
#[command(about = "Run coding agents in isolated, network-restricted sandboxes")]
#[command(version, author, long_about = None)]
pub struct Cli {
    /// Use the database at PATH instead of the one under the sandbox home
    #[arg(long = "db", value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new agent session
    Start(session::StartArgs),
    /// List sessions, newest first
    List(session::ListArgs),
    /// Show the details of a session
    Show(session::ShowArgs),
    /// Print the activity log of a session
    Logs(session::LogsArgs),
    /// Print the collected result of a session
    Result(result::ResultArgs),
    /// Apply the diff of a session to a checkout
    Apply(result::ApplyArgs),
    /// Score a finished session and store the quality result
    QualityCheck(result::QualityCheckArgs),
    /// Stop a running session
    Stop(session::StopArgs),
    /// Log the agent in and store its credentials
    Auth(session::AuthArgs),
    /// Remove all sandbox containers, the network and workspaces
    Cleanup(session::CleanupArgs),
}

impl Cli {
    /// Execute the selected command
    pub async fn run(self) -> Result<()> {
        let context = CliContext::load(self.db)?;
        match self.command {
            Commands::Start(args) => args.run(&context).await,
            Commands::List(args) => args.run(&context),
            Commands::Show(args) => args.run(&context),
            Commands::Logs(args) => args.run(&context),
            Commands::Result(args) => args.run(&context),
            Commands::Apply(args) => args.run(&context).await,
            Commands::QualityCheck(args) => args.run(&context).await,
            Commands::Stop(args) => args.run(&context).await,
            Commands::Auth(args) => args.run(&context).await,
            Commands::Cleanup(args) => args.run(&context).await,
        }
    }
}
