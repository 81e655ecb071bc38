//! Message data access object
//!
//! The local store is the single merge point for all configured targets.
//! `put` is idempotent on duplicate id, and `message_commits` rows record
//! which targets a message is already committed to — a message is pending
//! for a target exactly while no such row exists.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};

use super::models::{Message, MessageId, TargetKey};

/// Data access object for Message operations
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a message. Re-inserting an already-present id is a no-op;
    /// returns true when the row was actually written.
    pub fn put(&self, message: &Message) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
                 (id, content, author, created_at, origin_owner, origin_name, origin_branch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.as_str(),
                message.content,
                message.author,
                message.created_at.to_rfc3339(),
                message.origin.as_ref().map(|key| key.owner.clone()),
                message.origin.as_ref().map(|key| key.name.clone()),
                message.origin.as_ref().map(|key| key.branch.clone()),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Get a message by id
    pub fn get(&self, id: &MessageId) -> SqliteResult<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, content, author, created_at, origin_owner, origin_name, origin_branch
             FROM messages WHERE id = ?1",
            params![id.as_str()],
            Self::row_to_message,
        )
        .optional()
    }

    /// List messages with an id strictly greater than the marker, in id order.
    /// A None marker lists everything.
    pub fn list_since(&self, marker: Option<&MessageId>) -> SqliteResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, content, author, created_at, origin_owner, origin_name, origin_branch
             FROM messages WHERE id > ?1 ORDER BY id",
        )?;
        let marker = marker.map(|id| id.as_str()).unwrap_or("");
        let messages = stmt
            .query_map(params![marker], Self::row_to_message)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(messages)
    }

    /// Messages not yet committed to the given target, in id order.
    pub fn pending_for(&self, target: &TargetKey) -> SqliteResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.content, m.author, m.created_at,
                    m.origin_owner, m.origin_name, m.origin_branch
             FROM messages m
             WHERE NOT EXISTS (
                 SELECT 1 FROM message_commits c
                 WHERE c.message_id = m.id
                   AND c.owner = ?1 AND c.name = ?2 AND c.branch = ?3
             )
             ORDER BY m.id",
        )?;
        let messages = stmt
            .query_map(
                params![target.owner, target.name, target.branch],
                Self::row_to_message,
            )?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(messages)
    }

    /// Record that a message is committed to a target. Idempotent.
    pub fn record_commit(
        &self,
        id: &MessageId,
        target: &TargetKey,
        commit_sha: &str,
    ) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO message_commits
                 (message_id, owner, name, branch, commit_sha, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                target.owner,
                target.name,
                target.branch,
                commit_sha,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Commit sha recorded for a message on a target, if any.
    pub fn commit_for(&self, id: &MessageId, target: &TargetKey) -> SqliteResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT commit_sha FROM message_commits
             WHERE message_id = ?1 AND owner = ?2 AND name = ?3 AND branch = ?4",
            params![id.as_str(), target.owner, target.name, target.branch],
            |row| row.get(0),
        )
        .optional()
    }

    /// Convert a database row to a Message
    fn row_to_message(row: &rusqlite::Row) -> SqliteResult<Message> {
        let id: String = row.get(0)?;
        let created_at_str: String = row.get(3)?;
        let origin_owner: Option<String> = row.get(4)?;
        let origin_name: Option<String> = row.get(5)?;
        let origin_branch: Option<String> = row.get(6)?;

        let origin = match (origin_owner, origin_name, origin_branch) {
            (Some(owner), Some(name), Some(branch)) => Some(TargetKey::new(owner, name, branch)),
            _ => None,
        };

        Ok(Message {
            id: MessageId::from(id),
            content: row.get(1)?,
            author: row.get(2)?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, Database, MessageStore) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let dao = MessageStore::new(db.connection());
        (dir, db, dao)
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, _db, dao) = setup_db();
        let msg = Message::new("hello", "alice");

        assert!(dao.put(&msg).unwrap());
        let retrieved = dao.get(&msg.id).unwrap().unwrap();
        assert_eq!(retrieved, msg);
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, _db, dao) = setup_db();
        let msg = Message::new("hello", "alice");

        assert!(dao.put(&msg).unwrap());
        // Re-applying the same id is a no-op, even with different content
        let mut dup = msg.clone();
        dup.content = "something else".into();
        assert!(!dao.put(&dup).unwrap());

        let stored = dao.get(&msg.id).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
    }

    #[test]
    fn test_list_since() {
        let (_dir, _db, dao) = setup_db();
        let a = message_with_id("20250108T184100-0001", "first");
        let b = message_with_id("20250108T184200-0001", "second");
        dao.put(&b).unwrap();
        dao.put(&a).unwrap();

        let all = dao.list_since(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "first"); // Ordered by id

        let after_a = dao.list_since(Some(&a.id)).unwrap();
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].content, "second");
    }

    #[test]
    fn test_pending_tracks_per_target_commits() {
        let (_dir, _db, dao) = setup_db();
        let msg = Message::new("hello", "alice");
        dao.put(&msg).unwrap();

        let t1 = TargetKey::new("u", "r1", "main");
        let t2 = TargetKey::new("u", "r2", "main");
        assert_eq!(dao.pending_for(&t1).unwrap().len(), 1);

        dao.record_commit(&msg.id, &t1, "abc123").unwrap();
        assert!(dao.pending_for(&t1).unwrap().is_empty());
        // Commit against t1 leaves the message pending for t2
        assert_eq!(dao.pending_for(&t2).unwrap().len(), 1);
        assert_eq!(dao.commit_for(&msg.id, &t1).unwrap().unwrap(), "abc123");
        assert!(dao.commit_for(&msg.id, &t2).unwrap().is_none());
    }

    fn message_with_id(id: &str, content: &str) -> Message {
        let mut msg = Message::new(content, "alice");
        msg.id = MessageId::from(id);
        msg
    }
}
