//! Sync engine
//!
//! Orchestrates the fetch and push coordinators against the registry and the
//! local store. Owns the top-level consistency contract: fetch before push,
//! one cycle at a time (single-flight), and removal of targets only at safe
//! boundaries.

mod fetch;
mod push;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::data::{Database, MessageId, MessageStore, RepositoryTarget, TargetKey, TargetStore};
use crate::registry::{Registry, RegistryError};
use crate::remote::{RemoteError, RemoteFactory};

pub use fetch::{FetchCoordinator, FetchOutcome, FetchResult};
pub use push::{PushCoordinator, PushOutcome, PushResult, TargetPush};

/// Why a target made no (or partial) progress this cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The remote holds a message with this id but different content
    #[error("conflicting content for message {0}")]
    ConflictingContent(MessageId),
    #[error("local store error: {0}")]
    Store(String),
}

/// Per-target status in a [`SyncReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Synced {
        fetched: usize,
        pushed: usize,
    },
    /// The cycle made whatever progress it could before this error
    Failed {
        fetched: usize,
        pushed: usize,
        error: TargetError,
    },
    /// Cancelled before the target was started
    Skipped,
}

/// Outcome of one synchronization cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// New messages merged into the local store
    pub fetched: usize,
    /// Commits confirmed across all targets
    pub pushed: usize,
    pub per_target: BTreeMap<TargetKey, TargetStatus>,
}

impl SyncReport {
    /// The targets that need operator attention, with their errors.
    pub fn per_target_errors(&self) -> BTreeMap<TargetKey, TargetError> {
        self.per_target
            .iter()
            .filter_map(|(key, status)| match status {
                TargetStatus::Failed { error, .. } => Some((key.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }
}

type SharedCycle = Shared<BoxFuture<'static, SyncReport>>;

struct EngineInner {
    registry: Arc<Registry>,
    fetch: FetchCoordinator,
    push: PushCoordinator,
    /// Single-flight guard: the cycle currently running, if any
    inflight: Mutex<Option<SharedCycle>>,
}

/// Single entry point both sync directions funnel through.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    store: MessageStore,
}

impl SyncEngine {
    pub fn new(database: &Database, remotes: Arc<dyn RemoteFactory>) -> Self {
        let store = MessageStore::new(database.connection());
        let registry = Arc::new(Registry::new(TargetStore::new(database.connection())));
        let fetch = FetchCoordinator::new(store.clone(), registry.clone(), remotes.clone());
        let push = PushCoordinator::new(store.clone(), remotes);
        Self {
            inner: Arc::new(EngineInner {
                registry,
                fetch,
                push,
                inflight: Mutex::new(None),
            }),
            store,
        }
    }

    /// The local message store backing this engine.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Configure a new target. Takes effect on the next cycle.
    pub fn add_repository(&self, target: RepositoryTarget) -> Result<(), RegistryError> {
        self.inner.registry.add(target)
    }

    /// Remove a target. While a cycle is in flight the target is only
    /// flagged; it is dropped once that cycle completes.
    pub fn remove_repository(&self, key: &TargetKey) -> Result<(), RegistryError> {
        if self.inner.inflight.lock().is_some() {
            self.inner.registry.mark_retiring(key)
        } else {
            self.inner.registry.remove(key)
        }
    }

    /// The configured targets, as the next cycle would see them.
    pub fn list_repositories(&self) -> Result<Vec<RepositoryTarget>, RegistryError> {
        self.inner.registry.list()
    }

    /// Run one fetch-then-push cycle. Never re-entered concurrently: a call
    /// that finds a cycle already in flight awaits that cycle and returns
    /// its report instead of starting a duplicate.
    pub async fn sync_once(&self, cancel: CancellationToken) -> SyncReport {
        let cycle = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(cycle) = inflight.clone() {
                cycle
            } else {
                let inner = self.inner.clone();
                let cycle: SharedCycle = async move {
                    let report = run_cycle(&inner, cancel).await;
                    // Release the guard before handing the report out
                    inflight_done(&inner);
                    report
                }
                .boxed()
                .shared();
                *inflight = Some(cycle.clone());
                cycle
            }
        };
        cycle.await
    }
}

fn inflight_done(inner: &EngineInner) {
    inner.inflight.lock().take();
}

async fn run_cycle(inner: &EngineInner, cancel: CancellationToken) -> SyncReport {
    let targets = match inner.registry.list() {
        Ok(targets) => targets,
        Err(error) => {
            tracing::error!(error = %error, "Cannot snapshot registry; skipping cycle");
            return SyncReport::default();
        }
    };

    // Fetch before push: messages just received from a peer must not be
    // re-pushed under a new identity
    let fetch = inner.fetch.fetch_all(&targets, &cancel).await;
    let push = inner.push.push_all(&targets, &cancel).await;

    let mut report = SyncReport {
        fetched: fetch.merged.len(),
        ..SyncReport::default()
    };
    for target in &targets {
        let status = combine(
            fetch.per_target.get(&target.key),
            push.per_target.get(&target.key),
        );
        if let TargetStatus::Synced { pushed, .. } | TargetStatus::Failed { pushed, .. } = &status
        {
            report.pushed += pushed;
        }
        report.per_target.insert(target.key.clone(), status);
    }

    // Targets removed mid-cycle retire now, at the cycle boundary
    match inner.registry.sweep_retired() {
        Ok(swept) => {
            for key in swept {
                tracing::info!(target = %key, "Retired target removed");
            }
        }
        Err(error) => tracing::warn!(error = %error, "Failed to sweep retired targets"),
    }

    tracing::info!(
        fetched = report.fetched,
        pushed = report.pushed,
        targets = report.per_target.len(),
        errors = report.per_target_errors().len(),
        "Sync cycle complete"
    );
    report
}

/// Fold one target's fetch and push results into its report status.
fn combine(fetch: Option<&FetchResult>, push: Option<&PushResult>) -> TargetStatus {
    let fetched = match fetch {
        Some(FetchResult::Fetched { merged }) => *merged,
        _ => 0,
    };
    let (pushed, push_error) = match push {
        Some(PushResult::Pushed(push)) => {
            let error = push
                .error
                .clone()
                .or_else(|| push.failed.first().map(|(_, error)| error.clone()));
            (push.committed.len(), error)
        }
        _ => (0, None),
    };

    let fetch_skipped = matches!(fetch, None | Some(FetchResult::Skipped));
    let push_skipped = matches!(push, None | Some(PushResult::Skipped));
    if fetch_skipped && push_skipped {
        return TargetStatus::Skipped;
    }

    let error = match fetch {
        Some(FetchResult::Failed(error)) => Some(error.clone()),
        _ => push_error,
    };
    match error {
        Some(error) => TargetStatus::Failed {
            fetched,
            pushed,
            error,
        },
        None => TargetStatus::Synced { fetched, pushed },
    }
}
