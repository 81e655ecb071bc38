//! Fetch coordinator
//!
//! Pulls new messages from every configured target concurrently, merges the
//! per-target batches into one deterministically ordered timeline, drops
//! duplicates against the local store, and advances cursors only after the
//! store writes succeed (at-least-once delivery).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::TargetError;
use crate::codec;
use crate::data::{Message, MessageStore, RepositoryTarget, TargetKey};
use crate::registry::Registry;
use crate::remote::{RemoteError, RemoteFactory, RemoteRepository};

/// Per-target fetch outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Messages merged into the store (duplicates excluded from the count)
    Fetched { merged: usize },
    Failed(TargetError),
    /// Cancelled before the target was started
    Skipped,
}

/// Result of one fetch pass over all targets.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Newly stored messages, ordered by `(id, owner, name)`
    pub merged: Vec<Message>,
    pub per_target: BTreeMap<TargetKey, FetchResult>,
}

/// One target's raw batch before the merge: decoded messages paired with the
/// commit sha they were observed at.
struct TargetBatch {
    observed: Vec<(Message, String)>,
    new_cursor: Option<String>,
}

pub struct FetchCoordinator {
    store: MessageStore,
    registry: Arc<Registry>,
    remotes: Arc<dyn RemoteFactory>,
}

impl FetchCoordinator {
    pub fn new(
        store: MessageStore,
        registry: Arc<Registry>,
        remotes: Arc<dyn RemoteFactory>,
    ) -> Self {
        Self {
            store,
            registry,
            remotes,
        }
    }

    /// Fetch from every target concurrently and merge into the local store.
    /// A failed target never blocks the others; its cursor stays put so the
    /// next cycle retries from the same point.
    pub async fn fetch_all(
        &self,
        targets: &[RepositoryTarget],
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let batches = join_all(targets.iter().map(|target| {
            let remote = self.remotes.remote_for(target);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (target, None);
                }
                (target, Some(fetch_target(remote, target, &cancel).await))
            }
        }))
        .await;

        let mut outcome = FetchOutcome::default();
        // (batch index, message, observed sha) tuples from every successful
        // target, ordered into the single global timeline
        let mut pending: Vec<(usize, Message, String)> = Vec::new();
        let mut succeeded: Vec<(usize, &RepositoryTarget, Option<String>)> = Vec::new();

        for (idx, (target, result)) in batches.into_iter().enumerate() {
            match result {
                None => {
                    outcome
                        .per_target
                        .insert(target.key.clone(), FetchResult::Skipped);
                }
                Some(Err(error)) => {
                    tracing::warn!(target = %target.key, error = %error, "Fetch failed");
                    outcome
                        .per_target
                        .insert(target.key.clone(), FetchResult::Failed(error));
                }
                Some(Ok(batch)) => {
                    for (message, sha) in batch.observed {
                        pending.push((idx, message, sha));
                    }
                    succeeded.push((idx, target, batch.new_cursor));
                }
            }
        }

        // Deterministic merge order: message id, then origin owner/name
        pending.sort_by(|a, b| {
            let left = (&a.1.id, &a.1.origin);
            let right = (&b.1.id, &b.1.origin);
            left.cmp(&right)
        });

        let mut merged_counts: BTreeMap<usize, usize> = BTreeMap::new();
        let mut batch_errors: BTreeMap<usize, TargetError> = BTreeMap::new();

        for (idx, message, sha) in pending {
            let target = &targets[idx];
            match self.merge_one(&message, &sha, &target.key) {
                Ok(true) => {
                    *merged_counts.entry(idx).or_default() += 1;
                    outcome.merged.push(message);
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        target = %target.key,
                        id = %message.id,
                        error = %error,
                        "Failed to merge fetched message"
                    );
                    batch_errors.entry(idx).or_insert(error);
                }
            }
        }

        for (idx, target, new_cursor) in succeeded {
            let merged = merged_counts.get(&idx).copied().unwrap_or(0);
            if let Some(error) = batch_errors.remove(&idx) {
                // Store write failed: surface and leave the cursor alone so
                // the next cycle re-fetches (re-application is a no-op)
                outcome
                    .per_target
                    .insert(target.key.clone(), FetchResult::Failed(error));
                continue;
            }
            if let Some(cursor) = new_cursor {
                if target.cursor.as_deref() != Some(cursor.as_str()) {
                    if let Err(error) = self.registry.update_cursor(&target.key, &cursor) {
                        // Target removed mid-cycle; messages are already merged
                        tracing::debug!(target = %target.key, error = %error, "Cursor not advanced");
                    }
                }
            }
            outcome
                .per_target
                .insert(target.key.clone(), FetchResult::Fetched { merged });
        }

        outcome
    }

    /// Merge a single fetched message. Returns true when the store gained a
    /// new row, false for an already-present duplicate.
    fn merge_one(
        &self,
        message: &Message,
        sha: &str,
        origin: &TargetKey,
    ) -> Result<bool, TargetError> {
        match self
            .store
            .get(&message.id)
            .map_err(|e| TargetError::Store(e.to_string()))?
        {
            Some(existing) => {
                if !existing.same_payload(message) {
                    // Colliding id with different content is never silently
                    // resolved; the stored message wins and the target is
                    // flagged
                    return Err(TargetError::ConflictingContent(message.id.clone()));
                }
                self.store
                    .record_commit(&message.id, origin, sha)
                    .map_err(|e| TargetError::Store(e.to_string()))?;
                Ok(false)
            }
            None => {
                self.store
                    .put(message)
                    .map_err(|e| TargetError::Store(e.to_string()))?;
                // Remember the message already lives on its origin so push
                // does not echo it back
                self.store
                    .record_commit(&message.id, origin, sha)
                    .map_err(|e| TargetError::Store(e.to_string()))?;
                Ok(true)
            }
        }
    }
}

/// Collect one target's new messages. No store access here; the merge step
/// owns all local writes.
async fn fetch_target(
    remote: Arc<dyn RemoteRepository>,
    target: &RepositoryTarget,
    cancel: &CancellationToken,
) -> Result<TargetBatch, TargetError> {
    match &target.cursor {
        None => initial_scan(remote, target, cancel).await,
        Some(cursor) => incremental_fetch(remote, target, cursor, cancel).await,
    }
}

/// First fetch for a target: snapshot the message directory at the branch
/// head instead of replaying the entire commit history.
async fn initial_scan(
    remote: Arc<dyn RemoteRepository>,
    target: &RepositoryTarget,
    cancel: &CancellationToken,
) -> Result<TargetBatch, TargetError> {
    let Some(head) = remote.head().await? else {
        // Empty repository; nothing to record yet
        return Ok(TargetBatch {
            observed: Vec::new(),
            new_cursor: None,
        });
    };

    let files = match remote.list_files(&target.message_path).await {
        Ok(files) => files,
        // Message directory not created yet
        Err(RemoteError::NotFound(_)) => Vec::new(),
        Err(error) => return Err(error.into()),
    };

    let mut observed = Vec::new();
    for file in files.iter().filter(|f| f.name.ends_with(".json")) {
        if cancel.is_cancelled() {
            // Incomplete snapshot: keep the cursor unset so the next cycle
            // rescans from scratch
            return Ok(TargetBatch {
                observed,
                new_cursor: None,
            });
        }
        let bytes = match remote.read_file(Some(&head.sha), &file.path).await {
            Ok(bytes) => bytes,
            Err(RemoteError::NotFound(_)) => continue,
            Err(error) => return Err(error.into()),
        };
        if let Some(message) = decode_observed(&file.path, &bytes, target) {
            observed.push((message, head.sha.clone()));
        }
    }

    Ok(TargetBatch {
        observed,
        new_cursor: Some(head.sha),
    })
}

/// Walk commits after the cursor, oldest first, reading each touched message
/// file at its commit.
async fn incremental_fetch(
    remote: Arc<dyn RemoteRepository>,
    target: &RepositoryTarget,
    cursor: &str,
    cancel: &CancellationToken,
) -> Result<TargetBatch, TargetError> {
    let commits = remote.commits_since(cursor).await?;

    let mut observed = Vec::new();
    let mut last_processed = None;
    for commit in commits {
        if cancel.is_cancelled() {
            break;
        }
        for path in &commit.paths {
            let bytes = match remote.read_file(Some(&commit.sha), path).await {
                Ok(bytes) => bytes,
                // File was rewritten or removed by a later commit
                Err(RemoteError::NotFound(_)) => continue,
                Err(error) => return Err(error.into()),
            };
            if let Some(message) = decode_observed(path, &bytes, target) {
                observed.push((message, commit.sha.clone()));
            }
        }
        last_processed = Some(commit.sha);
    }

    Ok(TargetBatch {
        observed,
        new_cursor: last_processed,
    })
}

/// Decode one remote file, stamping the origin. A malformed file is logged
/// and skipped; it never poisons the batch.
fn decode_observed(path: &str, bytes: &[u8], target: &RepositoryTarget) -> Option<Message> {
    match codec::decode(path, bytes) {
        Ok(mut message) => {
            message.origin = Some(target.key.clone());
            Some(message)
        }
        Err(error) => {
            tracing::warn!(target = %target.key, error = %error, "Skipping undecodable file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Database, MessageId, TargetStore};
    use crate::remote::{MockRemoteFactory, RemoteError};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: MessageStore,
        registry: Arc<Registry>,
        remotes: Arc<MockRemoteFactory>,
        coordinator: FetchCoordinator,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let store = MessageStore::new(db.connection());
        let registry = Arc::new(Registry::new(TargetStore::new(db.connection())));
        let remotes = Arc::new(MockRemoteFactory::new());
        let coordinator =
            FetchCoordinator::new(store.clone(), registry.clone(), remotes.clone());
        Fixture {
            _dir: dir,
            store,
            registry,
            remotes,
            coordinator,
        }
    }

    fn message_with_id(id: &str, content: &str) -> Message {
        let mut msg = Message::new(content, "alice");
        msg.id = MessageId::from(id);
        msg
    }

    fn add_target(fixture: &Fixture, name: &str) -> RepositoryTarget {
        let target = RepositoryTarget::new("u", name);
        fixture.registry.add(target.clone()).unwrap();
        target
    }

    #[tokio::test]
    async fn test_merge_is_id_ordered_across_targets() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        let t2 = add_target(&fixture, "r2");
        let t3 = add_target(&fixture, "r3");

        // Arrival order per target is deliberately scrambled
        fixture
            .remotes
            .remote(&t2.key)
            .seed_message(&message_with_id("20250108T184300-0001", "C"), "messages");
        fixture
            .remotes
            .remote(&t3.key)
            .seed_message(&message_with_id("20250108T184100-0001", "A"), "messages");
        fixture
            .remotes
            .remote(&t1.key)
            .seed_message(&message_with_id("20250108T184200-0001", "B"), "messages");

        let targets = fixture.registry.list().unwrap();
        let outcome = fixture
            .coordinator
            .fetch_all(&targets, &CancellationToken::new())
            .await;

        let contents: Vec<&str> = outcome.merged.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["A", "B", "C"]);
        assert!(outcome
            .per_target
            .values()
            .all(|r| matches!(r, FetchResult::Fetched { merged: 1 })));
    }

    #[tokio::test]
    async fn test_duplicate_across_targets_stored_once() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        let t2 = add_target(&fixture, "r2");

        let msg = message_with_id("20250108T184100-000x", "X");
        fixture.remotes.remote(&t1.key).seed_message(&msg, "messages");
        fixture.remotes.remote(&t2.key).seed_message(&msg, "messages");

        let targets = fixture.registry.list().unwrap();
        let outcome = fixture
            .coordinator
            .fetch_all(&targets, &CancellationToken::new())
            .await;

        assert_eq!(outcome.merged.len(), 1);
        let stored = fixture.store.list_since(None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, msg.id);
        // Both origins are recorded as already holding the message
        assert!(fixture.store.commit_for(&msg.id, &t1.key).unwrap().is_some());
        assert!(fixture.store.commit_for(&msg.id, &t2.key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_target_does_not_poison_others() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        let t2 = add_target(&fixture, "r2");

        fixture
            .remotes
            .remote(&t1.key)
            .seed_message(&message_with_id("20250108T184100-0001", "A"), "messages");
        fixture
            .remotes
            .remote(&t2.key)
            .fail_all(RemoteError::Auth("expired".into()));

        let targets = fixture.registry.list().unwrap();
        let outcome = fixture
            .coordinator
            .fetch_all(&targets, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome.per_target[&t1.key],
            FetchResult::Fetched { merged: 1 }
        ));
        assert!(matches!(
            outcome.per_target[&t2.key],
            FetchResult::Failed(TargetError::Remote(RemoteError::Auth(_)))
        ));

        // Failed target's cursor untouched; healthy target advanced
        let listed = fixture.registry.list().unwrap();
        let cursor_of = |key: &TargetKey| {
            listed
                .iter()
                .find(|t| &t.key == key)
                .unwrap()
                .cursor
                .clone()
        };
        assert!(cursor_of(&t1.key).is_some());
        assert!(cursor_of(&t2.key).is_none());
    }

    #[tokio::test]
    async fn test_refetch_with_unchanged_cursor_is_empty() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        fixture
            .remotes
            .remote(&t1.key)
            .seed_message(&message_with_id("20250108T184100-0001", "A"), "messages");

        let first = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;
        assert_eq!(first.merged.len(), 1);
        let cursor_after_first = fixture.registry.list().unwrap()[0].cursor.clone();

        let second = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;
        assert!(second.merged.is_empty());
        assert!(matches!(
            second.per_target[&t1.key],
            FetchResult::Fetched { merged: 0 }
        ));
        assert_eq!(
            fixture.registry.list().unwrap()[0].cursor,
            cursor_after_first
        );
    }

    #[tokio::test]
    async fn test_incremental_fetch_after_initial_scan() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        let remote = fixture.remotes.remote(&t1.key);
        remote.seed_message(&message_with_id("20250108T184100-0001", "A"), "messages");

        fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;

        // New commit lands after the first sync
        remote.seed_message(&message_with_id("20250108T184200-0001", "B"), "messages");
        let outcome = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].content, "B");
    }

    #[tokio::test]
    async fn test_undecodable_file_skipped() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");
        let remote = fixture.remotes.remote(&t1.key);
        remote.seed_file("messages/garbage.json", b"not json at all");
        remote.seed_message(&message_with_id("20250108T184100-0001", "A"), "messages");

        let outcome = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome.per_target[&t1.key],
            FetchResult::Fetched { merged: 1 }
        ));
        assert_eq!(outcome.merged[0].content, "A");
    }

    #[tokio::test]
    async fn test_colliding_id_with_different_content_flagged() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");

        let stored = message_with_id("20250108T184100-0001", "original");
        fixture.store.put(&stored).unwrap();

        let mut tampered = stored.clone();
        tampered.content = "rewritten".into();
        fixture
            .remotes
            .remote(&t1.key)
            .seed_message(&tampered, "messages");

        let outcome = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome.per_target[&t1.key],
            FetchResult::Failed(TargetError::ConflictingContent(_))
        ));
        // Stored message wins
        assert_eq!(
            fixture.store.get(&stored.id).unwrap().unwrap().content,
            "original"
        );
    }

    #[tokio::test]
    async fn test_cancelled_targets_are_skipped() {
        let fixture = setup();
        let t1 = add_target(&fixture, "r1");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fixture
            .coordinator
            .fetch_all(&fixture.registry.list().unwrap(), &cancel)
            .await;

        assert!(matches!(outcome.per_target[&t1.key], FetchResult::Skipped));
    }
}
