//! SQLite search backend
//!
//! Message attributes live in a `messages` table, bodies in an FTS5 table
//! keyed by the same rowid. Flags are kept in a separate Flag Store
//! (`flags.db`) that survives rebuilds, so keys over flags, UIDs and
//! boolean structure are evaluated as set filters after the SQL query.

mod query;

use self::query::{compile, select, MAIN_JOINER};
use super::rebuild::RebuildTracker;
use super::{select_by_sequence, timestamp, uid_items, Hit, SearchBackend, SearchKey};

use async_trait::async_trait;
use mailidx_common::config::{IndexConfig, SqliteConfig};
use mailidx_common::flags;
use mailidx_common::types::{
    CmpOp, Condition, FlagTarget, IndexedItem, ItemId, MailboxDescriptor, MailboxId,
    MailboxQuery, MailboxStatus, MessageDocument, OpenMode, Property, RebuildState, SequenceSet,
    Uid,
};
use mailidx_common::{Error, Result};
use mailidx_storage::{FlagStore, SqliteDatabase, SqliteFlagStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.db";
const OLD_INDEX_FILE: &str = "index.db.old";
const FLAGS_FILE: &str = "flags.db";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        item_id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid INTEGER NOT NULL UNIQUE,
        mailbox_id INTEGER NOT NULL,
        size INTEGER NOT NULL,
        internal_date INTEGER NOT NULL,
        date INTEGER,
        subject TEXT NOT NULL DEFAULT '',
        from_addr TEXT NOT NULL DEFAULT '',
        to_addr TEXT NOT NULL DEFAULT '',
        cc_addr TEXT NOT NULL DEFAULT '',
        bcc_addr TEXT NOT NULL DEFAULT '',
        x_ml_name TEXT,
        x_mail_count INTEGER,
        location TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_mailbox ON messages (mailbox_id, uid)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(body)",
];

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("sqlite backend lock poisoned".to_string())
}

/// SQLite-backed index under `<data_dir>/index.db`
pub struct SqliteBackend {
    config: SqliteConfig,
    data_dir: PathBuf,
    index_path: PathBuf,
    old_path: PathBuf,
    flags_path: PathBuf,
    db: RwLock<Option<SqliteDatabase>>,
    old_db: RwLock<Option<SqliteDatabase>>,
    flag_store: RwLock<Option<Arc<SqliteFlagStore>>>,
    rebuild: RebuildTracker,
}

impl SqliteBackend {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            config: config.sqlite.clone(),
            data_dir: config.data_dir.clone(),
            index_path: config.data_dir.join(INDEX_FILE),
            old_path: config.data_dir.join(OLD_INDEX_FILE),
            flags_path: config.data_dir.join(FLAGS_FILE),
            db: RwLock::new(None),
            old_db: RwLock::new(None),
            flag_store: RwLock::new(None),
            rebuild: RebuildTracker::new(),
        }
    }

    /// Factory for the backend registry
    pub fn create(config: &IndexConfig) -> Result<Arc<dyn SearchBackend>> {
        Ok(Arc::new(Self::new(config)))
    }

    fn db(&self) -> Result<SqliteDatabase> {
        self.db
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| Error::IndexUnavailable("index is not open".to_string()))
    }

    fn take_db(&self) -> Result<Option<SqliteDatabase>> {
        Ok(self.db.write().map_err(poisoned)?.take())
    }

    fn flag_store(&self) -> Result<Arc<SqliteFlagStore>> {
        self.flag_store
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| Error::IndexUnavailable("flag store is not open".to_string()))
    }

    async fn open_db(&self, mode: OpenMode) -> Result<SqliteDatabase> {
        let db = SqliteDatabase::open(&self.index_path, mode, &self.config)
            .await
            .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
        if mode == OpenMode::ReadWrite {
            db.apply_schema(SCHEMA).await?;
        }
        Ok(db)
    }

    async fn resolve_uid(&self, target: FlagTarget) -> Result<Uid> {
        match target {
            FlagTarget::Uid(uid) => Ok(uid),
            FlagTarget::Item(item_id) => self.get_uid(item_id).await,
        }
    }

    /// Rows matching `query`, ascending by UID
    async fn query_hits(&self, query: &MailboxQuery) -> Result<Vec<Hit>> {
        let db = self.db()?;
        let mut builder = select(query)?;
        let rows: Vec<(i64, i64, i64)> = builder
            .build_query_as()
            .fetch_all(db.pool())
            .await
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(uid, item_id, internal_date)| Hit {
                uid: uid as Uid,
                item_id: item_id as ItemId,
                internal_date: timestamp(internal_date),
            })
            .collect())
    }

    async fn key_hits(&self, mailbox: &MailboxDescriptor, keys: &[SearchKey]) -> Result<Vec<Hit>> {
        for key in keys {
            key.ensure_supported()?;
        }

        let mut query = mailbox.query.clone();
        let mut deferred = Vec::new();
        for key in keys {
            match compile(key)? {
                Some(fragment) => query.merge(&fragment, MAIN_JOINER),
                None => deferred.push(key),
            }
        }

        let mut hits = self.query_hits(&query).await?;
        for key in deferred {
            hits = self.post_filter(mailbox, hits, key).await?;
        }
        Ok(hits)
    }

    /// Narrow `hits` by a key the SQL compiler left out
    async fn post_filter(
        &self,
        mailbox: &MailboxDescriptor,
        hits: Vec<Hit>,
        key: &SearchKey,
    ) -> Result<Vec<Hit>> {
        let keep: HashSet<Uid> = match key {
            SearchKey::Flag(_)
            | SearchKey::NoFlag(_)
            | SearchKey::Keyword(_)
            | SearchKey::NoKeyword(_) => {
                let store = self.flag_store()?;
                let mut keep = HashSet::new();
                for hit in &hits {
                    let message_flags = store.get(hit.uid).await?.unwrap_or_default();
                    if key.flag_matches(&message_flags) == Some(true) {
                        keep.insert(hit.uid);
                    }
                }
                keep
            }
            SearchKey::Uid(set) => {
                let max = if key.uses_last_uid() {
                    self.query_hits(&mailbox.query)
                        .await?
                        .last()
                        .map_or(0, |hit| hit.uid)
                } else {
                    0
                };
                hits.iter()
                    .map(|hit| hit.uid)
                    .filter(|&uid| set.contains(uid, max))
                    .collect()
            }
            SearchKey::Not(inner) => {
                let excluded: HashSet<Uid> = self
                    .search_by_keys(mailbox, std::slice::from_ref(inner.as_ref()))
                    .await?
                    .into_iter()
                    .collect();
                hits.iter()
                    .map(|hit| hit.uid)
                    .filter(|uid| !excluded.contains(uid))
                    .collect()
            }
            SearchKey::Or(a, b) => {
                let mut union: HashSet<Uid> = self
                    .search_by_keys(mailbox, std::slice::from_ref(a.as_ref()))
                    .await?
                    .into_iter()
                    .collect();
                union.extend(
                    self.search_by_keys(mailbox, std::slice::from_ref(b.as_ref()))
                        .await?,
                );
                union
            }
            SearchKey::Group(keys) => self
                .search_by_keys(mailbox, keys)
                .await?
                .into_iter()
                .collect(),
            _ => return Ok(hits),
        };

        Ok(hits.into_iter().filter(|hit| keep.contains(&hit.uid)).collect())
    }

    /// Forget flags of UIDs the rebuilt index no longer holds
    async fn prune_flags(&self) -> Result<()> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT uid FROM messages")
            .fetch_all(self.db()?.pool())
            .await
            .map_err(db_err)?;
        let live: HashSet<Uid> = rows.into_iter().map(|(uid,)| uid as Uid).collect();

        let pruned = self.flag_store()?.retain(&live).await?;
        if pruned > 0 {
            info!(pruned, "Dropped flags of messages missing from rebuilt index");
        }
        Ok(())
    }

    /// Close the live database and move it aside
    async fn swap_out(&self) -> Result<()> {
        if let Some(db) = self.take_db()? {
            db.close().await;
        }

        if tokio::fs::try_exists(&self.old_path).await? {
            warn!(path = %self.old_path.display(), "Removing stale old index");
            tokio::fs::remove_file(&self.old_path).await?;
        }

        if tokio::fs::try_exists(&self.index_path).await? {
            tokio::fs::rename(&self.index_path, &self.old_path).await?;
            let old = SqliteDatabase::open(&self.old_path, OpenMode::ReadOnly, &self.config)
                .await
                .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
            *self.old_db.write().map_err(poisoned)? = Some(old);
        }

        self.rebuild.rebuilding()?;

        let db = self.open_db(OpenMode::ReadWrite).await?;
        *self.db.write().map_err(poisoned)? = Some(db);
        Ok(())
    }
}

#[async_trait]
impl SearchBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn setup(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let db = self.open_db(OpenMode::ReadWrite).await?;
        db.close().await;
        info!(path = %self.index_path.display(), "SQLite index ready");
        Ok(())
    }

    async fn open(&self, mode: OpenMode) -> Result<()> {
        if let Some(db) = self.take_db()? {
            db.close().await;
        }
        let db = self.open_db(mode).await?;
        *self.db.write().map_err(poisoned)? = Some(db);
        debug!(path = %self.index_path.display(), ?mode, "Opened SQLite index");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(db) = self.take_db()? {
            db.close().await;
        }
        Ok(())
    }

    async fn standby(&self) -> Result<()> {
        if self.flag_store.read().map_err(poisoned)?.is_some() {
            return Ok(());
        }
        let store = SqliteFlagStore::open(&self.flags_path, &self.config).await?;
        *self.flag_store.write().map_err(poisoned)? = Some(Arc::new(store));
        debug!(path = %self.flags_path.display(), "Opened flag store");
        Ok(())
    }

    async fn relax(&self) -> Result<()> {
        let store = self.flag_store.write().map_err(poisoned)?.take();
        if let Some(store) = store {
            store.close().await;
        }
        Ok(())
    }

    fn default_query(&self, mailbox_id: MailboxId) -> MailboxQuery {
        MailboxQuery::new(
            "",
            vec![Condition::int(Property::MailboxId, CmpOp::Eq, mailbox_id as i64)],
        )
    }

    fn list_query(&self, ml_name: &str) -> MailboxQuery {
        MailboxQuery::new(
            "",
            vec![Condition::text(Property::XMlName, CmpOp::Eq, ml_name)],
        )
    }

    async fn register(&self, document: &MessageDocument, location: &str) -> Result<ItemId> {
        let db = self.db()?;
        let store = self.flag_store()?;
        let mut tx = db.pool().begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                uid, mailbox_id, size, internal_date, date, subject, from_addr,
                to_addr, cc_addr, bcc_addr, x_ml_name, x_mail_count, location
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document.uid as i64)
        .bind(document.mailbox_id as i64)
        .bind(document.size as i64)
        .bind(document.internal_date.timestamp())
        .bind(document.date.map(|d| d.timestamp()))
        .bind(&document.subject)
        .bind(&document.from)
        .bind(&document.to)
        .bind(&document.cc)
        .bind(&document.bcc)
        .bind(&document.x_ml_name)
        .bind(document.x_mail_count.map(|c| c as i64))
        .bind(location)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_error) if db_error.is_unique_violation() => {
                Error::Register(format!("uid {} is already indexed", document.uid))
            }
            _ => Error::Register(e.to_string()),
        })?;
        let item_id = result.last_insert_rowid();

        sqlx::query("INSERT INTO messages_fts (rowid, body) VALUES (?, ?)")
            .bind(item_id)
            .bind(&document.body)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Register(e.to_string()))?;

        tx.commit().await.map_err(db_err)?;
        store
            .set(document.uid, &flags::normalize(&document.flags))
            .await?;

        debug!(uid = document.uid, item_id, "Registered document");
        Ok(item_id as ItemId)
    }

    async fn get_uid(&self, item_id: ItemId) -> Result<Uid> {
        let db = self.db()?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT uid FROM messages WHERE item_id = ?")
            .bind(item_id as i64)
            .fetch_optional(db.pool())
            .await
            .map_err(db_err)?;

        row.map(|(uid,)| uid as Uid)
            .ok_or_else(|| Error::Storage(format!("no document with item id {}", item_id)))
    }

    async fn get_flags(&self, target: FlagTarget) -> Result<Option<String>> {
        let uid = self.resolve_uid(target).await?;
        self.flag_store()?.get(uid).await
    }

    async fn set_flags(&self, target: FlagTarget, flags: &str) -> Result<()> {
        let uid = self.resolve_uid(target).await?;
        self.flag_store()?.set(uid, &flags::normalize(flags)).await
    }

    async fn delete_flags(&self, target: FlagTarget) -> Result<()> {
        let uid = self.resolve_uid(target).await?;
        self.flag_store()?.delete(uid).await
    }

    async fn delete(&self, uid: Uid, item_id: ItemId) -> Result<()> {
        let db = self.db()?;
        let mut tx = db.pool().begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM messages WHERE item_id = ?")
            .bind(item_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM messages_fts WHERE rowid = ?")
            .bind(item_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        self.flag_store()?.delete(uid).await
    }

    async fn fetch(
        &self,
        mailbox: &MailboxDescriptor,
        set: &SequenceSet,
    ) -> Result<Vec<IndexedItem>> {
        let hits = self.query_hits(&mailbox.query).await?;
        Ok(select_by_sequence(&hits, set))
    }

    async fn uid_fetch(
        &self,
        mailbox: &MailboxDescriptor,
        set: &SequenceSet,
    ) -> Result<Vec<IndexedItem>> {
        if set.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self
            .key_hits(mailbox, &[SearchKey::Uid(set.clone())])
            .await?;
        Ok(uid_items(&hits))
    }

    async fn status(&self, mailbox: &MailboxDescriptor) -> Result<MailboxStatus> {
        let hits = self.query_hits(&mailbox.query).await?;
        let store = self.flag_store()?;

        let mut unseen = 0;
        for hit in &hits {
            let message_flags = store.get(hit.uid).await?.unwrap_or_default();
            if !flags::contains(&message_flags, flags::SEEN) {
                unseen += 1;
            }
        }

        Ok(MailboxStatus {
            messages: hits.len() as u64,
            unseen,
            recent: hits
                .iter()
                .filter(|hit| hit.uid > mailbox.last_peeked_uid)
                .count() as u64,
        })
    }

    async fn search(&self, mailbox: &MailboxDescriptor, query: &MailboxQuery) -> Result<Vec<Uid>> {
        let mut merged = mailbox.query.clone();
        merged.merge(query, MAIN_JOINER);
        let hits = self.query_hits(&merged).await?;
        Ok(hits.into_iter().map(|hit| hit.uid).collect())
    }

    async fn search_by_keys(
        &self,
        mailbox: &MailboxDescriptor,
        keys: &[SearchKey],
    ) -> Result<Vec<Uid>> {
        let hits = self.key_hits(mailbox, keys).await?;
        Ok(hits.into_iter().map(|hit| hit.uid).collect())
    }

    async fn try_query(&self, raw: &str) -> Result<()> {
        let db = self.db()?;
        sqlx::query("SELECT rowid FROM messages_fts WHERE messages_fts MATCH ? LIMIT 1")
            .bind(raw)
            .fetch_optional(db.pool())
            .await
            .map_err(|e| Error::InvalidQuery(format!("{} in '{}'", e, raw)))?;
        Ok(())
    }

    async fn begin_rebuild(&self, mode: OpenMode) -> Result<()> {
        if mode == OpenMode::ReadOnly {
            return Err(Error::IndexUnavailable(
                "cannot rebuild a read-only index".to_string(),
            ));
        }

        self.rebuild.begin()?;
        if let Err(e) = self.swap_out().await {
            if let Err(state_err) = self.rebuild.finish(false) {
                warn!("Failed to reset rebuild state: {}", state_err);
            }
            return Err(e);
        }

        info!(old = %self.old_path.display(), "Moved SQLite index aside for rebuild");
        Ok(())
    }

    async fn finish_rebuild(&self, committed: bool) -> Result<()> {
        let old = self.old_db.write().map_err(poisoned)?.take();
        if let Some(old) = old {
            old.close().await;
        }

        if committed {
            self.prune_flags().await?;
        }

        let old_exists = tokio::fs::try_exists(&self.old_path).await?;
        if committed && old_exists {
            tokio::fs::remove_file(&self.old_path).await?;
            debug!(path = %self.old_path.display(), "Removed old index");
        } else if !committed && old_exists {
            warn!(path = %self.old_path.display(), "Rebuild rolled back, old index left on disk");
        }

        self.rebuild.finish(committed)
    }

    async fn get_old_flags(&self, uid: Uid) -> Result<Option<String>> {
        let old = self
            .old_db
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or(Error::NoOldIndex)?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT item_id FROM messages WHERE uid = ?")
            .bind(uid as i64)
            .fetch_optional(old.pool())
            .await
            .map_err(db_err)?;

        match row {
            Some(_) => self.flag_store()?.get(uid).await,
            None => Ok(None),
        }
    }

    fn rebuild_state(&self) -> RebuildState {
        self.rebuild.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn backend(temp_dir: &TempDir) -> SqliteBackend {
        let mut config = IndexConfig::default();
        config.engine = "sqlite".to_string();
        config.data_dir = temp_dir.path().to_path_buf();

        let backend = SqliteBackend::new(&config);
        backend.setup().await.unwrap();
        backend.standby().await.unwrap();
        backend.open(OpenMode::ReadWrite).await.unwrap();
        backend
    }

    fn message(uid: Uid, mailbox_id: MailboxId) -> MessageDocument {
        MessageDocument::new(uid, mailbox_id, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[tokio::test]
    async fn test_item_ids_resolve_to_uids() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;

        let first = backend.register(&message(10, 1), "a").await.unwrap();
        let second = backend.register(&message(20, 1), "b").await.unwrap();
        assert!(second > first);

        assert_eq!(backend.get_uid(second).await.unwrap(), 20);
        backend
            .set_flags(FlagTarget::Item(second), "\\Seen")
            .await
            .unwrap();
        assert_eq!(
            backend.get_flags(FlagTarget::Uid(20)).await.unwrap(),
            Some("\\Seen".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_query_and_substring_headers() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;

        let mut doc = message(1, 1);
        doc.subject = "[ruby-list:100] Hello".to_string();
        doc.x_ml_name = Some("ruby-list".to_string());
        backend.register(&doc, "a").await.unwrap();
        backend.register(&message(2, 1), "b").await.unwrap();

        let list = MailboxDescriptor {
            id: 9,
            name: "ml/ruby-list".to_string(),
            query: backend.list_query("ruby-list"),
            last_peeked_uid: 0,
        };
        assert_eq!(backend.search_by_keys(&list, &[]).await.unwrap(), vec![1]);

        let key = SearchKey::Header(Property::Subject, "hello".to_string());
        assert_eq!(backend.search_by_keys(&list, &[key]).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_flag_keys_need_standby() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;
        backend.register(&message(1, 1), "a").await.unwrap();
        backend.relax().await.unwrap();

        let mailbox = MailboxDescriptor {
            id: 1,
            name: "INBOX".to_string(),
            query: backend.default_query(1),
            last_peeked_uid: 0,
        };
        let result = backend
            .search_by_keys(&mailbox, &[SearchKey::Flag("\\Seen".to_string())])
            .await;
        assert!(matches!(result, Err(Error::IndexUnavailable(_))));
    }

    #[tokio::test]
    async fn test_try_query() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;

        backend.try_query("\"hello world\"").await.unwrap();
        assert!(matches!(
            backend.try_query("\"unterminated").await,
            Err(Error::InvalidQuery(_))
        ));
    }
}
