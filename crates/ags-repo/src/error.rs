use thiserror::Error;

/// Failures of git operations on a workspace or checkout.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("No git repository at or above {0}")]
    RepositoryNotFound(String),

    #[error("`{command}` exited with {exit_code}: {}", .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git produced invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    Other(String),
}

impl VcsError {
    /// Standard error output of a failed git invocation, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            VcsError::CommandFailed { stderr, .. } => Some(stderr.trim()),
            _ => None,
        }
    }
}

pub type VcsResult<T> = Result<T, VcsError>;
