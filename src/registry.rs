//! Repository registry
//!
//! Holds the configured set of remote targets and their sync cursors.
//! Mutation is serialized behind a single writer lock; reads hand out owned
//! snapshots so sync cycles never observe a half-applied change.

use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

use crate::data::{RepositoryTarget, TargetKey, TargetStore};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("target {0} is already configured")]
    DuplicateTarget(TargetKey),
    #[error("target {0} is not configured")]
    NotFound(TargetKey),
    #[error("target store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub struct Registry {
    store: TargetStore,
    /// Serializes add/remove/cursor writes (single-writer discipline)
    writer: Mutex<()>,
    /// Targets flagged for removal while a sync cycle is in flight
    retiring: Mutex<HashSet<TargetKey>>,
}

impl Registry {
    pub fn new(store: TargetStore) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
            retiring: Mutex::new(HashSet::new()),
        }
    }

    /// Add a target. Fails if `(owner, name, branch)` is already configured.
    pub fn add(&self, target: RepositoryTarget) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        if self.store.get(&target.key)?.is_some() {
            return Err(RegistryError::DuplicateTarget(target.key));
        }
        self.retiring.lock().remove(&target.key);
        self.store.create(&target)?;
        Ok(())
    }

    /// Remove a target immediately. Fails if absent.
    pub fn remove(&self, key: &TargetKey) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        if !self.store.delete(key)? {
            return Err(RegistryError::NotFound(key.clone()));
        }
        self.retiring.lock().remove(key);
        Ok(())
    }

    /// Flag a target for removal at the next safe boundary. The target stays
    /// visible to the in-flight cycle's snapshot but disappears from
    /// subsequent [`Registry::list`] calls.
    pub fn mark_retiring(&self, key: &TargetKey) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        if self.store.get(key)?.is_none() {
            return Err(RegistryError::NotFound(key.clone()));
        }
        self.retiring.lock().insert(key.clone());
        Ok(())
    }

    /// Drop every retiring target. Called by the engine once the cycle that
    /// was reading them has completed.
    pub fn sweep_retired(&self) -> Result<Vec<TargetKey>, RegistryError> {
        let _guard = self.writer.lock();
        let keys: Vec<TargetKey> = self.retiring.lock().drain().collect();
        for key in &keys {
            // Already-gone rows are fine; retiring is advisory
            self.store.delete(key)?;
        }
        Ok(keys)
    }

    /// Owned snapshot of the configured targets, retiring ones excluded.
    pub fn list(&self) -> Result<Vec<RepositoryTarget>, RegistryError> {
        let retiring = self.retiring.lock().clone();
        let targets = self
            .store
            .get_all()?
            .into_iter()
            .filter(|t| !retiring.contains(&t.key))
            .collect();
        Ok(targets)
    }

    /// Advance a target's sync cursor. Fails if the target was removed
    /// concurrently.
    pub fn update_cursor(&self, key: &TargetKey, cursor: &str) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        if !self.store.set_cursor(key, cursor)? {
            return Err(RegistryError::NotFound(key.clone()));
        }
        Ok(())
    }
}
