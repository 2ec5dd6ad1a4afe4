//! Result commands: print, apply and quality check.

use crate::context::{current_dir, CliContext};
use ags_core::{DEFAULT_PHASE, QUALITY_CHECK_PHASE};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Arguments for printing a result
#[derive(Args)]
pub struct ResultArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,

    /// Phase the result was stored under
    #[arg(long = "phase", value_name = "PHASE", default_value = DEFAULT_PHASE)]
    pub phase: String,

    /// Print the result metadata as JSON instead of the content
    #[arg(long = "metadata")]
    pub metadata: bool,
}

impl ResultArgs {
    pub fn run(self, context: &CliContext) -> Result<()> {
        let result = context
            .db
            .get_result(&self.session, &self.phase)?
            .with_context(|| format!("No {} result for session '{}'", self.phase, self.session))?;

        if self.metadata {
            let metadata = result.metadata.unwrap_or(serde_json::Value::Null);
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        } else if result.content.is_empty() {
            eprintln!("Session '{}' produced an empty {} result", self.session, result.kind);
        } else {
            print!("{}", result.content);
            if !result.content.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}

/// Arguments for applying a diff result
#[derive(Args)]
pub struct ApplyArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,

    /// Phase the diff was stored under
    #[arg(long = "phase", value_name = "PHASE", default_value = DEFAULT_PHASE)]
    pub phase: String,

    /// Checkout to apply the diff to (default: current directory)
    #[arg(long = "repo", value_name = "PATH")]
    pub repo: Option<PathBuf>,
}

impl ApplyArgs {
    pub async fn run(self, context: &CliContext) -> Result<()> {
        let target = match self.repo {
            Some(path) => path,
            None => current_dir()?,
        };
        let manager = context.manager_for_session(&self.session).await?;
        manager
            .apply_result(&self.session, &self.phase, &target)
            .await
            .with_context(|| format!("Failed to apply diff of session '{}'", self.session))?;
        println!(
            "Applied diff of session '{}' to {}",
            self.session,
            target.display()
        );
        Ok(())
    }
}

/// Arguments for the quality check
#[derive(Args)]
pub struct QualityCheckArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,
}

impl QualityCheckArgs {
    pub async fn run(self, context: &CliContext) -> Result<()> {
        let manager = context.manager_for_session(&self.session).await?;
        let Some(result) = manager
            .run_quality_check(&self.session)
            .await
            .with_context(|| format!("Quality check of session '{}' failed", self.session))?
        else {
            println!("No implementation to check for session '{}'", self.session);
            return Ok(());
        };
        println!("{}", result.content);
        println!(
            "Stored under phase '{}'. Use `ags result {} --phase {} --metadata` for details.",
            QUALITY_CHECK_PHASE, self.session, QUALITY_CHECK_PHASE
        );
        Ok(())
    }
}
