//! Data persistence layer for repochat
//!
//! This module provides SQLite-based storage for messages and repository
//! targets, plus the per-target commit bookkeeping the push coordinator
//! relies on.

mod database;
mod messages;
mod migrations;
mod models;
mod targets;

pub use database::{Database, DatabaseError};
pub use messages::MessageStore;
pub use models::{
    CommitRef, Message, MessageId, RemoteFile, RepositoryTarget, TargetKey, DEFAULT_BRANCH,
    DEFAULT_MESSAGE_PATH,
};
pub use targets::TargetStore;
