//! Remote repository client
//!
//! Abstract capability over one remote Git-hosted repository: read the
//! message file tree, read file content, create a file (commit), and walk
//! commit history. Implemented against the GitHub REST API in
//! [`github::GithubRemote`]; tests script [`mock::MockRemote`] instead.

pub mod github;
pub mod mock;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::{CommitRef, RemoteFile, RepositoryTarget};

pub use github::{GithubRemote, GithubRemoteFactory};
pub use mock::{MockRemote, MockRemoteFactory};
pub use retry::{with_retry, RetryPolicy};

/// Closed error taxonomy for remote operations.
///
/// Per-target isolation in the sync coordinators is built on this set:
/// `Network` and `RateLimited` are retried with backoff, `Conflict` gets one
/// bounded retry at the push layer, and `Auth`/`NotFound` propagate
/// immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Credential rejected (401/403-class). Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Rate limited (429-class), optionally carrying a retry-after hint.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Remote branch advanced past our last known state (409-class).
    #[error("remote state conflict: {0}")]
    Conflict(String),
    /// Repository, branch, or file does not exist (404-class).
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport-level failure or 5xx response.
    #[error("network error: {0}")]
    Network(String),
}

impl RemoteError {
    /// Whether a bounded retry with backoff can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::RateLimited { .. }
        )
    }
}

/// Capability interface for one configured remote repository.
///
/// Within a target, callers issue operations sequentially (a branch has a
/// single linear history); implementations must be safe to share across
/// targets running in parallel.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Latest commit on the target branch, or None for an empty repository.
    async fn head(&self) -> Result<Option<CommitRef>, RemoteError>;

    /// Commits after `cursor`, oldest first, with the message files each one
    /// touched. Implementations stop paginating as soon as the cursor is
    /// seen; if the cursor is no longer reachable (force push) the collected
    /// window is returned in full and store-level dedup absorbs the replay.
    async fn commits_since(&self, cursor: &str) -> Result<Vec<CommitRef>, RemoteError>;

    /// List the files currently under `dir` on the target branch.
    async fn list_files(&self, dir: &str) -> Result<Vec<RemoteFile>, RemoteError>;

    /// Read a file at a specific commit, or at the branch head when
    /// `reference` is None.
    async fn read_file(&self, reference: Option<&str>, path: &str)
        -> Result<Vec<u8>, RemoteError>;

    /// Create `path` on the target branch in a new commit.
    async fn commit_file(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<CommitRef, RemoteError>;
}

/// Builds the remote client for a target. The engine takes this as its seam
/// so cycles can run against mocks in tests.
pub trait RemoteFactory: Send + Sync {
    fn remote_for(&self, target: &RepositoryTarget) -> Arc<dyn RemoteRepository>;
}
