use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{VcsError, VcsResult};

/// A git working copy.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Open the repository containing `path_in_repo`, searching parent directories.
    pub fn open<P: AsRef<Path>>(path_in_repo: P) -> VcsResult<Self> {
        let root = Self::find_repo_root(path_in_repo.as_ref())?;
        Ok(Self { root })
    }

    /// Clone `source` into `destination` and open the new working copy.
    ///
    /// `destination` must not exist yet; its parent is created if needed.
    pub fn clone_from<S: AsRef<Path>, D: AsRef<Path>>(
        source: S,
        destination: D,
    ) -> VcsResult<Self> {
        let source = source.as_ref();
        let destination = destination.as_ref();

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let cmd = vec![
            "git".to_string(),
            "clone".to_string(),
            "--quiet".to_string(),
            source.to_string_lossy().to_string(),
            destination.to_string_lossy().to_string(),
        ];
        run_command(&parent, &cmd)?;
        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            "Cloned repository"
        );

        Ok(Self {
            root: destination.to_path_buf(),
        })
    }

    /// Get the repository root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage every change in the working copy, including deletions and untracked files.
    pub fn stage_all(&self) -> VcsResult<()> {
        self.run_command(&git(&["add", "-A"]))?;
        Ok(())
    }

    /// Stage the paths matched by a git pathspec.
    pub fn stage_pathspec(&self, pathspec: &str) -> VcsResult<()> {
        self.run_command(&git(&["add", "--", pathspec]))?;
        Ok(())
    }

    /// Diff of the index against `HEAD`. Empty when nothing is staged.
    pub fn staged_diff(&self) -> VcsResult<String> {
        let output = self.run_raw(&git(&["diff", "--cached"]))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Porcelain status of the working copy.
    pub fn status_porcelain(&self) -> VcsResult<String> {
        self.run_command(&git(&["status", "--porcelain"]))
    }

    /// Apply a unified diff to the working copy.
    pub fn apply_patch(&self, patch: &str) -> VcsResult<()> {
        if patch.trim().is_empty() {
            return Err(VcsError::Other("Refusing to apply an empty patch".to_string()));
        }

        let mut file = tempfile::Builder::new().prefix("ags-").suffix(".diff").tempfile()?;
        file.write_all(patch.as_bytes())?;
        if !patch.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;

        let patch_path = file.path().to_string_lossy().to_string();
        self.run_command(&git(&["apply", "--whitespace=nowarn", &patch_path]))?;
        Ok(())
    }

    fn find_repo_root(start_path: &Path) -> VcsResult<PathBuf> {
        let start = if start_path.is_absolute() {
            start_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(start_path)
        };

        let mut current = Some(start.as_path());
        while let Some(dir) = current {
            // .git is a file for worktrees and submodules
            if dir.join(".git").exists() {
                return Ok(dir.to_path_buf());
            }
            current = dir.parent();
        }

        Err(VcsError::RepositoryNotFound(start_path.to_string_lossy().to_string()))
    }

    fn run_command(&self, cmd: &[String]) -> VcsResult<String> {
        run_command(&self.root, cmd)
    }

    fn run_raw(&self, cmd: &[String]) -> VcsResult<Vec<u8>> {
        run_raw(&self.root, cmd)
    }
}

pub(crate) fn git(args: &[&str]) -> Vec<String> {
    std::iter::once("git").chain(args.iter().copied()).map(str::to_string).collect()
}

pub(crate) fn run_command(dir: &Path, cmd: &[String]) -> VcsResult<String> {
    let stdout = run_raw(dir, cmd)?;
    String::from_utf8(stdout).map_err(VcsError::Utf8)
}

fn run_raw(dir: &Path, cmd: &[String]) -> VcsResult<Vec<u8>> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| VcsError::Other("Empty command".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "echo")
        .env("SSH_ASKPASS", "echo")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| VcsError::CommandFailed {
            command: cmd.join(" "),
            exit_code: -1,
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(VcsError::CommandFailed {
            command: cmd.join(" "),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: stderr.to_string(),
        })
    }
}
