//! Mock remote repository for deterministic testing
//!
//! Implements the RemoteRepository trait over scriptable in-memory state so
//! coordinator and engine tests run without a network. Commits behave like
//! the hosting API: creating a path that already exists raises a conflict,
//! and successful writes append to the commit log.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RemoteError, RemoteFactory, RemoteRepository};
use crate::codec;
use crate::data::{CommitRef, Message, RemoteFile, RepositoryTarget, TargetKey};

/// Number of calls issued per operation, for assertions on retry and
/// single-flight behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub head: u32,
    pub commits_since: u32,
    pub list_files: u32,
    pub read_file: u32,
    pub commit_file: u32,
}

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    commits: Vec<CommitRef>,
    /// When set, every operation fails with this error
    fail_all: Option<RemoteError>,
    /// Errors consumed by the next commit_file calls, in order
    commit_errors: VecDeque<RemoteError>,
    /// Simulated latency per operation
    delay: Duration,
    calls: CallCounts,
}

/// Scriptable in-memory remote repository.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file plus the commit that introduced it.
    pub fn seed_file(&self, path: &str, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.files.insert(path.to_string(), bytes.to_vec());
        let sha = format!("sha{:04}", state.commits.len() + 1);
        state.commits.push(CommitRef {
            sha,
            message: format!("Add {path}"),
            paths: vec![path.to_string()],
        });
    }

    /// Seed an encoded message file under the given message path.
    pub fn seed_message(&self, message: &Message, message_path: &str) {
        let (path, bytes) = codec::encode(message, message_path);
        self.seed_file(&path, &bytes);
    }

    /// Make every operation fail with the given error.
    pub fn fail_all(&self, error: RemoteError) {
        self.state.lock().fail_all = Some(error);
    }

    /// Undo [`MockRemote::fail_all`], e.g. after a credential fix.
    pub fn clear_fail_all(&self) {
        self.state.lock().fail_all = None;
    }

    /// Queue an error for an upcoming commit_file call.
    pub fn fail_next_commit(&self, error: RemoteError) {
        self.state.lock().commit_errors.push_back(error);
    }

    /// Simulate network latency on every operation.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    async fn pace(&self) {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    fn check_fail(state: &MockState) -> Result<(), RemoteError> {
        match &state.fail_all {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteRepository for MockRemote {
    async fn head(&self) -> Result<Option<CommitRef>, RemoteError> {
        self.pace().await;
        let mut state = self.state.lock();
        state.calls.head += 1;
        Self::check_fail(&state)?;
        Ok(state.commits.last().cloned())
    }

    async fn commits_since(&self, cursor: &str) -> Result<Vec<CommitRef>, RemoteError> {
        self.pace().await;
        let mut state = self.state.lock();
        state.calls.commits_since += 1;
        Self::check_fail(&state)?;
        let start = state
            .commits
            .iter()
            .position(|c| c.sha == cursor)
            .map(|idx| idx + 1)
            // Unknown cursor replays the whole window, like the real client
            .unwrap_or(0);
        Ok(state.commits[start..].to_vec())
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        self.pace().await;
        let mut state = self.state.lock();
        state.calls.list_files += 1;
        Self::check_fail(&state)?;
        let prefix = format!("{}/", dir.trim_matches('/'));
        Ok(state
            .files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .map(|path| RemoteFile {
                path: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
            })
            .collect())
    }

    async fn read_file(
        &self,
        _reference: Option<&str>,
        path: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        self.pace().await;
        let mut state = self.state.lock();
        state.calls.read_file += 1;
        Self::check_fail(&state)?;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<CommitRef, RemoteError> {
        self.pace().await;
        let mut state = self.state.lock();
        state.calls.commit_file += 1;
        Self::check_fail(&state)?;
        if let Some(error) = state.commit_errors.pop_front() {
            return Err(error);
        }
        if state.files.contains_key(path) {
            return Err(RemoteError::Conflict(format!("{path} already exists")));
        }

        state.files.insert(path.to_string(), content.to_vec());
        let commit = CommitRef {
            sha: format!("sha{:04}", state.commits.len() + 1),
            message: message.to_string(),
            paths: vec![path.to_string()],
        };
        state.commits.push(commit.clone());
        Ok(commit)
    }
}

/// Factory handing out one mock per target key.
#[derive(Default)]
pub struct MockRemoteFactory {
    remotes: Mutex<HashMap<TargetKey, Arc<MockRemote>>>,
}

impl MockRemoteFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or lazily create) the mock behind a target key.
    pub fn remote(&self, key: &TargetKey) -> Arc<MockRemote> {
        self.remotes
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MockRemote::new()))
            .clone()
    }
}

impl RemoteFactory for MockRemoteFactory {
    fn remote_for(&self, target: &RepositoryTarget) -> Arc<dyn RemoteRepository> {
        self.remote(&target.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_then_read_back() {
        let remote = MockRemote::new();
        let commit = remote
            .commit_file("messages/a.json", b"{}", "Add message a")
            .await
            .unwrap();
        assert_eq!(commit.sha, "sha0001");

        let head = remote.head().await.unwrap().unwrap();
        assert_eq!(head.sha, commit.sha);
        assert_eq!(
            remote.read_file(None, "messages/a.json").await.unwrap(),
            b"{}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_existing_path_conflicts() {
        let remote = MockRemote::new();
        remote.seed_file("messages/a.json", b"{}");
        let err = remote
            .commit_file("messages/a.json", b"{}", "Add message a")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_commits_since_cursor() {
        let remote = MockRemote::new();
        remote.seed_file("messages/a.json", b"{}");
        remote.seed_file("messages/b.json", b"{}");
        remote.seed_file("messages/c.json", b"{}");

        let newer = remote.commits_since("sha0001").await.unwrap();
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].paths, vec!["messages/b.json".to_string()]);

        // Unknown cursor replays everything
        assert_eq!(remote.commits_since("gone").await.unwrap().len(), 3);
    }
}
