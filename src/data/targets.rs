//! Repository target data access object

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};

use super::models::{RepositoryTarget, TargetKey};

/// Data access object for RepositoryTarget rows
#[derive(Clone)]
pub struct TargetStore {
    conn: Arc<Mutex<Connection>>,
}

impl TargetStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a new target. Fails on a duplicate `(owner, name, branch)`.
    pub fn create(&self, target: &RepositoryTarget) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (owner, name, branch, message_path, cursor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.key.owner,
                target.key.name,
                target.key.branch,
                target.message_path,
                target.cursor,
                target.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a target by key
    pub fn get(&self, key: &TargetKey) -> SqliteResult<Option<RepositoryTarget>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT owner, name, branch, message_path, cursor, created_at
             FROM targets WHERE owner = ?1 AND name = ?2 AND branch = ?3",
            params![key.owner, key.name, key.branch],
            Self::row_to_target,
        )
        .optional()
    }

    /// Get all targets, ordered by key
    pub fn get_all(&self) -> SqliteResult<Vec<RepositoryTarget>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT owner, name, branch, message_path, cursor, created_at
             FROM targets ORDER BY owner, name, branch",
        )?;
        let targets = stmt
            .query_map([], Self::row_to_target)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Delete a target. Returns true when a row was removed.
    pub fn delete(&self, key: &TargetKey) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM targets WHERE owner = ?1 AND name = ?2 AND branch = ?3",
            params![key.owner, key.name, key.branch],
        )?;
        Ok(deleted > 0)
    }

    /// Update a target's sync cursor. Returns true when the target exists.
    pub fn set_cursor(&self, key: &TargetKey, cursor: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE targets SET cursor = ?4
             WHERE owner = ?1 AND name = ?2 AND branch = ?3",
            params![key.owner, key.name, key.branch, cursor],
        )?;
        Ok(updated > 0)
    }

    /// Convert a database row to a RepositoryTarget
    fn row_to_target(row: &rusqlite::Row) -> SqliteResult<RepositoryTarget> {
        let owner: String = row.get(0)?;
        let name: String = row.get(1)?;
        let branch: String = row.get(2)?;
        let created_at_str: String = row.get(5)?;

        Ok(RepositoryTarget {
            key: TargetKey::new(owner, name, branch),
            message_path: row.get(3)?,
            cursor: row.get(4)?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, Database, TargetStore) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let dao = TargetStore::new(db.connection());
        (dir, db, dao)
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, _db, dao) = setup_db();
        let target = RepositoryTarget::new("octo", "chat");

        dao.create(&target).unwrap();
        let retrieved = dao.get(&target.key).unwrap().unwrap();
        assert_eq!(retrieved.key, target.key);
        assert_eq!(retrieved.message_path, "messages");
        assert!(retrieved.cursor.is_none());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, _db, dao) = setup_db();
        let target = RepositoryTarget::new("octo", "chat");

        dao.create(&target).unwrap();
        assert!(dao.create(&target).is_err());
    }

    #[test]
    fn test_same_repo_different_branch_allowed() {
        let (_dir, _db, dao) = setup_db();
        dao.create(&RepositoryTarget::new("octo", "chat")).unwrap();
        dao.create(&RepositoryTarget::new("octo", "chat").with_branch("dev"))
            .unwrap();
        assert_eq!(dao.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_set_cursor() {
        let (_dir, _db, dao) = setup_db();
        let target = RepositoryTarget::new("octo", "chat");
        dao.create(&target).unwrap();

        assert!(dao.set_cursor(&target.key, "abc123").unwrap());
        let updated = dao.get(&target.key).unwrap().unwrap();
        assert_eq!(updated.cursor.as_deref(), Some("abc123"));

        let missing = TargetKey::new("octo", "gone", "main");
        assert!(!dao.set_cursor(&missing, "abc123").unwrap());
    }

    #[test]
    fn test_delete() {
        let (_dir, _db, dao) = setup_db();
        let target = RepositoryTarget::new("octo", "chat");
        dao.create(&target).unwrap();

        assert!(dao.delete(&target.key).unwrap());
        assert!(!dao.delete(&target.key).unwrap());
        assert!(dao.get(&target.key).unwrap().is_none());
    }
}
