//! Git operations for agent sandbox workspaces.
//!
//! Workspaces are plain git clones of a project checkout. This crate wraps the
//! handful of git commands the sandbox needs: cloning, staging, reading the
//! staged diff and applying a stored patch back onto a checkout.

pub mod error;
pub mod repo;
pub mod test_helpers;

pub use error::{VcsError, VcsResult};
pub use repo::GitRepo;
