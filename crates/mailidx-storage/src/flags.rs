//! Flag Store - durable UID to flag-string mapping kept beside the index

use crate::db::SqliteDatabase;
use async_trait::async_trait;
use mailidx_common::config::SqliteConfig;
use mailidx_common::types::{OpenMode, Uid};
use mailidx_common::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Flag store trait
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(&self, uid: Uid) -> Result<Option<String>>;
    async fn set(&self, uid: Uid, flags: &str) -> Result<()>;
    async fn delete(&self, uid: Uid) -> Result<()>;
    /// Drop every entry whose UID is not in `keep`; returns how many went
    async fn retain(&self, keep: &HashSet<Uid>) -> Result<u64>;
}

const SCHEMA: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS flags (
        uid INTEGER PRIMARY KEY,
        flags TEXT NOT NULL
    )
    "#];

/// SQLite-backed flag store
pub struct SqliteFlagStore {
    db: SqliteDatabase,
}

impl SqliteFlagStore {
    /// Open (creating if needed) the flag database at `path`
    pub async fn open(path: &Path, config: &SqliteConfig) -> Result<Self> {
        let db = SqliteDatabase::open(path, OpenMode::ReadWrite, config).await?;
        db.apply_schema(SCHEMA).await?;
        Ok(Self { db })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

#[async_trait]
impl FlagStore for SqliteFlagStore {
    async fn get(&self, uid: Uid) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT flags FROM flags WHERE uid = ?")
            .bind(uid as i64)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|(flags,)| flags))
    }

    async fn set(&self, uid: Uid, flags: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flags (uid, flags) VALUES (?, ?)
            ON CONFLICT(uid) DO UPDATE SET flags = excluded.flags
            "#,
        )
        .bind(uid as i64)
        .bind(flags)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, uid: Uid) -> Result<()> {
        sqlx::query("DELETE FROM flags WHERE uid = ?")
            .bind(uid as i64)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn retain(&self, keep: &HashSet<Uid>) -> Result<u64> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let uids: Vec<(i64,)> = sqlx::query_as("SELECT uid FROM flags")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut removed = 0;
        for (uid,) in uids {
            if keep.contains(&(uid as Uid)) {
                continue;
            }
            removed += sqlx::query("DELETE FROM flags WHERE uid = ?")
                .bind(uid)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?
                .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteFlagStore::open(&temp_dir.path().join("flags.db"), &SqliteConfig::default())
            .await
            .unwrap();

        assert_eq!(store.get(1).await.unwrap(), None);

        store.set(1, "\\Seen").await.unwrap();
        store.set(1, "\\Seen \\Answered").await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), Some("\\Seen \\Answered".to_string()));

        store.delete(1).await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flags_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("flags.db");

        let store = SqliteFlagStore::open(&path, &SqliteConfig::default()).await.unwrap();
        store.set(42, "$Work").await.unwrap();
        store.close().await;

        let store = SqliteFlagStore::open(&path, &SqliteConfig::default()).await.unwrap();
        assert_eq!(store.get(42).await.unwrap(), Some("$Work".to_string()));
    }

    #[tokio::test]
    async fn test_retain_prunes_unlisted_uids() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteFlagStore::open(&temp_dir.path().join("flags.db"), &SqliteConfig::default())
            .await
            .unwrap();

        store.set(1, "\\Seen").await.unwrap();
        store.set(2, "\\Flagged").await.unwrap();
        store.set(3, "").await.unwrap();

        let keep: HashSet<Uid> = [1, 3].into_iter().collect();
        assert_eq!(store.retain(&keep).await.unwrap(), 1);

        assert_eq!(store.get(1).await.unwrap(), Some("\\Seen".to_string()));
        assert_eq!(store.get(2).await.unwrap(), None);
        assert_eq!(store.get(3).await.unwrap(), Some(String::new()));
    }
}
