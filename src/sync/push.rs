//! Push coordinator
//!
//! Commits pending local messages to every configured target. Commits for
//! one target are sequential (its branch has a single linear history);
//! targets proceed fully in parallel and fail independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::TargetError;
use crate::codec;
use crate::data::{Message, MessageId, MessageStore, RepositoryTarget, TargetKey};
use crate::remote::{RemoteError, RemoteFactory, RemoteRepository};

/// Per-target push outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Pushed(TargetPush),
    /// Cancelled before the target was started
    Skipped,
}

/// What happened to a target's pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPush {
    /// Messages confirmed committed this pass
    pub committed: Vec<MessageId>,
    /// Messages that failed individually (still pending for this target)
    pub failed: Vec<(MessageId, TargetError)>,
    /// Terminal error that stopped the queue early; the remainder stays
    /// pending for the next cycle
    pub error: Option<TargetError>,
}

/// Result of one push pass over all targets.
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    pub per_target: BTreeMap<TargetKey, PushResult>,
}

pub struct PushCoordinator {
    store: MessageStore,
    remotes: Arc<dyn RemoteFactory>,
}

impl PushCoordinator {
    pub fn new(store: MessageStore, remotes: Arc<dyn RemoteFactory>) -> Self {
        Self { store, remotes }
    }

    /// Push pending messages to every target in parallel. A message leaves a
    /// target's pending set only once that target's remote confirms the
    /// commit.
    pub async fn push_all(
        &self,
        targets: &[RepositoryTarget],
        cancel: &CancellationToken,
    ) -> PushOutcome {
        let results = join_all(targets.iter().map(|target| {
            let remote = self.remotes.remote_for(target);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (target.key.clone(), PushResult::Skipped);
                }
                let push = self.push_target(remote, target, &cancel).await;
                (target.key.clone(), PushResult::Pushed(push))
            }
        }))
        .await;

        PushOutcome {
            per_target: results.into_iter().collect(),
        }
    }

    /// Drain one target's pending queue sequentially.
    async fn push_target(
        &self,
        remote: Arc<dyn RemoteRepository>,
        target: &RepositoryTarget,
        cancel: &CancellationToken,
    ) -> TargetPush {
        let mut push = TargetPush::default();

        let pending = match self.store.pending_for(&target.key) {
            Ok(pending) => pending,
            Err(error) => {
                push.error = Some(TargetError::Store(error.to_string()));
                return push;
            }
        };

        for message in pending {
            if cancel.is_cancelled() {
                break;
            }
            match self.push_one(remote.as_ref(), target, &message).await {
                Ok(sha) => {
                    if let Err(error) = self.store.record_commit(&message.id, &target.key, &sha) {
                        push.error = Some(TargetError::Store(error.to_string()));
                        break;
                    }
                    push.committed.push(message.id.clone());
                }
                Err(error @ TargetError::Remote(RemoteError::Conflict(_))) => {
                    // Conflict is scoped to this one message; keep draining
                    tracing::warn!(
                        target = %target.key,
                        id = %message.id,
                        error = %error,
                        "Message commit failed"
                    );
                    push.failed.push((message.id.clone(), error));
                }
                Err(error) => {
                    // Auth failures and exhausted retries stop the queue;
                    // nothing later can succeed against this target now
                    tracing::warn!(
                        target = %target.key,
                        error = %error,
                        "Aborting push for target"
                    );
                    push.error = Some(error);
                    break;
                }
            }
        }

        push
    }

    /// Commit one message, with the conflict policy: on `Conflict`, re-read
    /// the path — byte-equal content means another replica already delivered
    /// it — then retry the commit once before surfacing the failure.
    async fn push_one(
        &self,
        remote: &dyn RemoteRepository,
        target: &RepositoryTarget,
        message: &Message,
    ) -> Result<String, TargetError> {
        let (path, bytes) = codec::encode(message, &target.message_path);
        let commit_message = format!("Add message {}", message.id);

        match remote.commit_file(&path, &bytes, &commit_message).await {
            Ok(commit) => Ok(commit.sha),
            Err(RemoteError::Conflict(_)) => {
                if let Ok(existing) = remote.read_file(None, &path).await {
                    if let Ok(decoded) = codec::decode(&path, &existing) {
                        if message.same_payload(&decoded) {
                            // Already present remotely; resolve to the branch
                            // head so the bookkeeping row has a real sha
                            let sha = match remote.head().await {
                                Ok(Some(head)) => head.sha,
                                _ => "unknown".to_string(),
                            };
                            return Ok(sha);
                        }
                    }
                }
                let commit = remote.commit_file(&path, &bytes, &commit_message).await?;
                Ok(commit.sha)
            }
            Err(error) => Err(error.into()),
        }
    }
}
