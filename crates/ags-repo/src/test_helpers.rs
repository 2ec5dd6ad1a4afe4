//! Git repository fixtures for unit and integration tests.
//!
//! Sandbox tests need a throwaway project checkout to clone workspaces from.
//! The fixture lives in a temporary directory and commits with a local
//! identity so it never depends on the host's git configuration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;

use crate::error::VcsResult;
use crate::repo::{git, run_command};

/// Check if git is available on the system.
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Contents of a fixture project.
///
/// ```rust
/// use ags_repo::test_helpers::GitRepoConfig;
///
/// let config = GitRepoConfig::new().file("src/main.py", "print('hi')\n");
/// assert_eq!(config.initial_files.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct GitRepoConfig {
    /// Files committed in the initial commit; a README by default.
    pub initial_files: Vec<(String, String)>,
    pub commit_message: String,
}

impl GitRepoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the initial commit.
    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.initial_files.push((path.into(), content.into()));
        self
    }
}

impl Default for GitRepoConfig {
    fn default() -> Self {
        Self {
            initial_files: vec![("README.md".to_string(), "# Fixture project\n".to_string())],
            commit_message: "Initial commit".to_string(),
        }
    }
}

/// A committed project checkout in a temporary directory.
pub struct SimpleGitRepo {
    /// Keeps the directory alive for the lifetime of the fixture.
    pub repo: TempDir,
    pub path: PathBuf,
}

/// Create a project checkout with one commit holding the configured files.
pub async fn create_git_repo(
    config: Option<GitRepoConfig>,
) -> Result<SimpleGitRepo, Box<dyn std::error::Error>> {
    let config = config.unwrap_or_default();
    let repo = TempDir::new()?;
    let path = repo.path().to_path_buf();

    let seeded = tokio::task::spawn_blocking({
        let path = path.clone();
        move || seed_repository(&path, &config)
    })
    .await?;
    seeded?;

    Ok(SimpleGitRepo { repo, path })
}

fn seed_repository(path: &Path, config: &GitRepoConfig) -> VcsResult<()> {
    let steps: [&[&str]; 4] = [
        &["init", "--quiet"],
        &["config", "user.email", "fixture@ags.invalid"],
        &["config", "user.name", "Sandbox Fixture"],
        &["config", "commit.gpgsign", "false"],
    ];
    for args in steps {
        run_command(path, &git(args))?;
    }

    for (relative, content) in &config.initial_files {
        let file = path.join(relative);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, content)?;
    }
    run_command(path, &git(&["add", "-A"]))?;
    run_command(
        path,
        &git(&["commit", "--quiet", "--allow-empty", "-m", &config.commit_message]),
    )?;
    Ok(())
}
