//! tantivy search backend
//!
//! Every search key compiles to one query-parser string. Header substring
//! keys are the exception: the analyzer only knows whole tokens, so they are
//! resolved against stored header values into UID sets first. Flags live
//! inside the indexed document, so changing them re-indexes the message. The
//! item id of a document is its UID. Commits and directory moves run on the
//! blocking pool.

mod query;
mod schema;

use self::query::{and, compile, render_query};
use self::schema::{build_schema, Fields};
use super::key::contains_folded;
use super::rebuild::RebuildTracker;
use super::{select_by_sequence, timestamp, uid_items, Hit, SearchBackend, SearchKey};

use async_trait::async_trait;
use mailidx_common::config::{IndexConfig, TantivyConfig};
use mailidx_common::flags;
use mailidx_common::types::{
    FlagTarget, IndexedItem, ItemId, MailboxDescriptor, MailboxId, MailboxQuery, MailboxStatus,
    MessageDocument, OpenMode, Property, RebuildState, SequenceItem, SequenceSet, Uid,
};
use mailidx_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::query::{AllQuery, Query, QueryParser, TermQuery};
use tantivy::schema::{IndexRecordOption, TantivyDocument, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use tracing::{debug, info, warn};

const INDEX_DIR: &str = "tantivy";
const OLD_INDEX_DIR: &str = "tantivy.old";

fn storage_err(e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("tantivy: {}", e))
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("tantivy backend lock poisoned".to_string())
}

/// Run index I/O on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking index task failed: {}", e)))?
}

/// Commit `open` without stalling the runtime
async fn commit(open: &Arc<OpenIndex>) -> Result<()> {
    let open = Arc::clone(open);
    blocking(move || open.commit()).await
}

/// An index directory opened for reading, and for writing unless read-only
struct OpenIndex {
    index: Index,
    reader: IndexReader,
    writer: Option<Mutex<IndexWriter>>,
    fields: Fields,
}

impl OpenIndex {
    fn open(path: &Path, mode: OpenMode, heap: usize) -> Result<Self> {
        let index = Index::open_in_dir(path).map_err(|e| {
            Error::IndexUnavailable(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::from_index(index, mode, heap)
    }

    fn create(path: &Path, heap: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let index = Index::create_in_dir(path, build_schema()).map_err(|e| {
            Error::IndexUnavailable(format!("Failed to create {}: {}", path.display(), e))
        })?;
        Self::from_index(index, OpenMode::ReadWrite, heap)
    }

    fn from_index(index: Index, mode: OpenMode, heap: usize) -> Result<Self> {
        let fields = Fields::from_schema(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| Error::IndexUnavailable(format!("Failed to create reader: {}", e)))?;

        let writer = match mode {
            OpenMode::ReadWrite => {
                let writer = index.writer_with_num_threads(1, heap).map_err(|e| {
                    Error::IndexUnavailable(format!("Failed to create writer: {}", e))
                })?;
                Some(Mutex::new(writer))
            }
            OpenMode::ReadOnly => None,
        };

        Ok(Self {
            index,
            reader,
            writer,
            fields,
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, IndexWriter>> {
        self.writer
            .as_ref()
            .ok_or_else(|| Error::IndexUnavailable("index is open read-only".to_string()))?
            .lock()
            .map_err(poisoned)
    }

    /// Commit pending writes and make them visible to searchers
    fn commit(&self) -> Result<()> {
        self.writer()?.commit().map_err(storage_err)?;
        self.reader.reload().map_err(storage_err)
    }

    fn parse(&self, text: &str) -> Result<Box<dyn Query>> {
        if text.trim().is_empty() {
            return Ok(Box::new(AllQuery));
        }

        let mut parser =
            QueryParser::for_index(&self.index, vec![self.fields.body, self.fields.subject]);
        parser.set_conjunction_by_default();
        parser
            .parse_query(text)
            .map_err(|e| Error::InvalidQuery(format!("{} in '{}'", e, text)))
    }

    /// Stored documents matching `text`, ascending by UID
    fn documents(&self, text: &str) -> Result<Vec<(Uid, TantivyDocument)>> {
        let query = self.parse(text)?;
        let searcher = self.reader.searcher();
        let addresses = searcher
            .search(&*query, &DocSetCollector)
            .map_err(storage_err)?;

        let mut docs = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address).map_err(storage_err)?;
            let uid = doc
                .get_first(self.fields.uid)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::Storage("stored document has no uid".to_string()))?;
            docs.push((uid, doc));
        }

        docs.sort_by_key(|(uid, _)| *uid);
        Ok(docs)
    }

    /// Matching documents, ascending by UID
    fn hits(&self, text: &str) -> Result<Vec<Hit>> {
        let hits = self
            .documents(text)?
            .into_iter()
            .map(|(uid, doc)| {
                let internal_date = doc
                    .get_first(self.fields.internal_date)
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default();
                Hit {
                    uid,
                    item_id: uid,
                    internal_date: timestamp(internal_date),
                }
            })
            .collect();
        Ok(hits)
    }

    fn count(&self, text: &str) -> Result<u64> {
        let query = self.parse(text)?;
        let count = self
            .reader
            .searcher()
            .search(&*query, &Count)
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    fn find(&self, uid: Uid) -> Result<Option<TantivyDocument>> {
        let query = TermQuery::new(
            Term::from_field_u64(self.fields.uid, uid),
            IndexRecordOption::Basic,
        );
        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(storage_err)?;

        match top_docs.first() {
            Some((_score, address)) => Ok(Some(searcher.doc(*address).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    /// Flag string of a stored document; `None` once its flags were deleted
    fn stored_flags(&self, doc: &TantivyDocument) -> Option<String> {
        doc.get_first(self.fields.flags)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Whether the stored `property` header of `doc` contains `needle`
    fn header_contains(&self, doc: &TantivyDocument, property: Property, needle: &str) -> bool {
        self.fields
            .text_field(property)
            .and_then(|field| doc.get_first(field))
            .and_then(|v| v.as_str())
            .is_some_and(|value| contains_folded(value, needle))
    }
}

/// Swap header substring keys for the UIDs of `docs` they select
fn resolve_substrings(
    open: &OpenIndex,
    docs: &[(Uid, TantivyDocument)],
    key: &SearchKey,
) -> SearchKey {
    if let Some((property, needle)) = key.substring() {
        let items: Vec<SequenceItem> = docs
            .iter()
            .filter(|(_, doc)| open.header_contains(doc, property, needle))
            .map(|(uid, _)| SequenceItem::Number(*uid))
            .collect();
        return if items.is_empty() {
            SearchKey::not(SearchKey::All)
        } else {
            SearchKey::Uid(SequenceSet::from(items))
        };
    }

    match key {
        SearchKey::Not(inner) => SearchKey::not(resolve_substrings(open, docs, inner)),
        SearchKey::Or(a, b) => SearchKey::or(
            resolve_substrings(open, docs, a),
            resolve_substrings(open, docs, b),
        ),
        SearchKey::Group(keys) => SearchKey::Group(
            keys.iter()
                .map(|k| resolve_substrings(open, docs, k))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// tantivy-backed index under `<data_dir>/tantivy`
pub struct TantivyBackend {
    config: TantivyConfig,
    index_path: PathBuf,
    old_path: PathBuf,
    live: RwLock<Option<Arc<OpenIndex>>>,
    old: RwLock<Option<Arc<OpenIndex>>>,
    /// Characters indexed since the last commit during a rebuild
    pending_chars: AtomicUsize,
    rebuild: RebuildTracker,
}

impl TantivyBackend {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            config: config.tantivy.clone(),
            index_path: config.data_dir.join(INDEX_DIR),
            old_path: config.data_dir.join(OLD_INDEX_DIR),
            live: RwLock::new(None),
            old: RwLock::new(None),
            pending_chars: AtomicUsize::new(0),
            rebuild: RebuildTracker::new(),
        }
    }

    /// Factory for the backend registry
    pub fn create(config: &IndexConfig) -> Result<Arc<dyn SearchBackend>> {
        Ok(Arc::new(Self::new(config)))
    }

    fn exists(path: &Path) -> bool {
        path.join("meta.json").exists()
    }

    fn live(&self) -> Result<Arc<OpenIndex>> {
        self.live
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| Error::IndexUnavailable("index is not open".to_string()))
    }

    /// Live index with every pending write visible
    async fn readable(&self) -> Result<Arc<OpenIndex>> {
        let open = self.live()?;
        if self.pending_chars.swap(0, Ordering::SeqCst) > 0 {
            commit(&open).await?;
        }
        Ok(open)
    }

    fn replace_live(&self, next: Option<Arc<OpenIndex>>) -> Result<Option<Arc<OpenIndex>>> {
        let mut live = self.live.write().map_err(poisoned)?;
        Ok(std::mem::replace(&mut *live, next))
    }

    /// Commit after a write. Inside a rebuild, commits wait until enough
    /// text has accumulated.
    async fn written(&self, open: &Arc<OpenIndex>, chars: usize) -> Result<()> {
        if !self.rebuild.in_progress() {
            return commit(open).await;
        }

        let chars = chars.max(1);
        let pending = self.pending_chars.fetch_add(chars, Ordering::SeqCst) + chars;
        if pending >= self.config.sync_threshold_chars {
            self.pending_chars.store(0, Ordering::SeqCst);
            debug!(pending, "Syncing index during rebuild");
            commit(open).await?;
        }
        Ok(())
    }

    async fn close_live(&self) -> Result<()> {
        if let Some(open) = self.replace_live(None)? {
            if open.writer.is_some() && self.pending_chars.swap(0, Ordering::SeqCst) > 0 {
                commit(&open).await?;
            }
        }
        Ok(())
    }

    /// Re-index a stored document with new flags, or with none at all
    async fn rewrite_flags(
        &self,
        open: &Arc<OpenIndex>,
        doc: &TantivyDocument,
        flags: Option<&str>,
    ) -> Result<()> {
        let (message, location) = open.fields.from_document(doc)?;
        let doc = open
            .fields
            .to_document_with_flags(&message, &location, flags);

        {
            let writer = open.writer()?;
            writer.delete_term(Term::from_field_u64(open.fields.uid, message.uid));
            writer.add_document(doc).map_err(storage_err)?;
        }

        self.pending_chars.store(0, Ordering::SeqCst);
        commit(open).await
    }

    /// Hits for `keys` inside the mailbox scope
    fn key_hits(
        &self,
        open: &OpenIndex,
        mailbox: &MailboxDescriptor,
        keys: &[SearchKey],
    ) -> Result<Vec<Hit>> {
        for key in keys {
            key.ensure_supported()?;
        }

        let scope = render_query(&mailbox.query)?;
        let last_uid = if keys.iter().any(SearchKey::uses_last_uid) {
            open.hits(&scope.clone().into_query_text())?
                .last()
                .map_or(0, |hit| hit.uid)
        } else {
            0
        };

        let resolved: Vec<SearchKey> = if keys.iter().any(SearchKey::has_substring) {
            let docs = open.documents(&scope.clone().into_query_text())?;
            keys.iter()
                .map(|key| resolve_substrings(open, &docs, key))
                .collect()
        } else {
            keys.to_vec()
        };

        let mut parts = vec![scope];
        for key in &resolved {
            parts.push(compile(key, last_uid)?);
        }

        let text = and(parts).into_query_text();
        debug!(query = %text, "Searching tantivy index");
        open.hits(&text)
    }

    /// Move the live index aside and start an empty one
    async fn swap_out(&self) -> Result<()> {
        self.close_live().await?;
        let heap = self.config.writer_heap_bytes;

        if tokio::fs::try_exists(&self.old_path).await? {
            warn!(path = %self.old_path.display(), "Removing stale old index");
            tokio::fs::remove_dir_all(&self.old_path).await?;
        }

        if Self::exists(&self.index_path) {
            tokio::fs::rename(&self.index_path, &self.old_path).await?;
            let old_path = self.old_path.clone();
            let old = blocking(move || OpenIndex::open(&old_path, OpenMode::ReadOnly, heap)).await?;
            *self.old.write().map_err(poisoned)? = Some(Arc::new(old));
        } else if tokio::fs::try_exists(&self.index_path).await? {
            tokio::fs::remove_dir_all(&self.index_path).await?;
        }

        self.rebuild.rebuilding()?;

        let index_path = self.index_path.clone();
        let fresh = blocking(move || OpenIndex::create(&index_path, heap)).await?;
        self.replace_live(Some(Arc::new(fresh)))?;
        Ok(())
    }
}

fn target_uid(target: FlagTarget) -> Uid {
    match target {
        FlagTarget::Uid(uid) | FlagTarget::Item(uid) => uid,
    }
}

#[async_trait]
impl SearchBackend for TantivyBackend {
    fn name(&self) -> &'static str {
        "tantivy"
    }

    async fn setup(&self) -> Result<()> {
        if Self::exists(&self.index_path) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.index_path).await?;
        let index_path = self.index_path.clone();
        blocking(move || {
            Index::create_in_dir(&index_path, build_schema()).map_err(|e| {
                Error::IndexUnavailable(format!("Failed to create {}: {}", index_path.display(), e))
            })
        })
        .await?;
        info!(path = %self.index_path.display(), "Created tantivy index");
        Ok(())
    }

    async fn open(&self, mode: OpenMode) -> Result<()> {
        self.close_live().await?;
        let index_path = self.index_path.clone();
        let heap = self.config.writer_heap_bytes;
        let open = blocking(move || OpenIndex::open(&index_path, mode, heap)).await?;
        self.replace_live(Some(Arc::new(open)))?;
        debug!(path = %self.index_path.display(), ?mode, "Opened tantivy index");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_live().await
    }

    async fn standby(&self) -> Result<()> {
        Ok(())
    }

    async fn relax(&self) -> Result<()> {
        Ok(())
    }

    fn default_query(&self, mailbox_id: MailboxId) -> MailboxQuery {
        MailboxQuery::new(format!("mailbox_id:{}", mailbox_id), Vec::new())
    }

    fn list_query(&self, ml_name: &str) -> MailboxQuery {
        MailboxQuery::new(format!("x_ml_name:{}", query::quote(ml_name)), Vec::new())
    }

    async fn register(&self, document: &MessageDocument, location: &str) -> Result<ItemId> {
        let open = self.live()?;
        if open.find(document.uid)?.is_some() {
            return Err(Error::Register(format!(
                "uid {} is already indexed",
                document.uid
            )));
        }

        let doc = open.fields.to_document(document, location);
        open.writer()?
            .add_document(doc)
            .map_err(|e| Error::Register(e.to_string()))?;
        self.written(&open, document.subject.len() + document.body.len())
            .await?;

        debug!(uid = document.uid, "Registered document");
        Ok(document.uid)
    }

    async fn get_uid(&self, item_id: ItemId) -> Result<Uid> {
        match self.readable().await?.find(item_id)? {
            Some(_) => Ok(item_id),
            None => Err(Error::Storage(format!("no document with item id {}", item_id))),
        }
    }

    async fn get_flags(&self, target: FlagTarget) -> Result<Option<String>> {
        let open = self.readable().await?;
        Ok(open
            .find(target_uid(target))?
            .and_then(|doc| open.stored_flags(&doc)))
    }

    async fn set_flags(&self, target: FlagTarget, flags: &str) -> Result<()> {
        let uid = target_uid(target);
        let open = self.readable().await?;
        let doc = open
            .find(uid)?
            .ok_or_else(|| Error::Storage(format!("no document with uid {}", uid)))?;
        self.rewrite_flags(&open, &doc, Some(flags)).await
    }

    async fn delete_flags(&self, target: FlagTarget) -> Result<()> {
        let open = self.readable().await?;
        match open.find(target_uid(target))? {
            Some(doc) if open.stored_flags(&doc).is_some() => {
                self.rewrite_flags(&open, &doc, None).await
            }
            _ => Ok(()),
        }
    }

    async fn delete(&self, uid: Uid, _item_id: ItemId) -> Result<()> {
        let open = self.live()?;
        open.writer()?
            .delete_term(Term::from_field_u64(open.fields.uid, uid));
        self.pending_chars.store(0, Ordering::SeqCst);
        commit(&open).await
    }

    async fn fetch(
        &self,
        mailbox: &MailboxDescriptor,
        set: &SequenceSet,
    ) -> Result<Vec<IndexedItem>> {
        let open = self.readable().await?;
        let hits = open.hits(&render_query(&mailbox.query)?.into_query_text())?;
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
        let open = self.readable().await?;
        let hits = self.key_hits(&open, mailbox, &[SearchKey::Uid(set.clone())])?;
        Ok(uid_items(&hits))
    }

    async fn status(&self, mailbox: &MailboxDescriptor) -> Result<MailboxStatus> {
        let open = self.readable().await?;
        let scope = render_query(&mailbox.query)?;

        let unseen = compile(&SearchKey::NoFlag(flags::SEEN.to_string()), 0)?;
        let first_recent = mailbox.last_peeked_uid.saturating_add(1);
        let recent = compile(
            &SearchKey::Uid(SequenceSet::from(vec![SequenceItem::Range(first_recent, None)])),
            0,
        )?;

        Ok(MailboxStatus {
            messages: open.count(&scope.clone().into_query_text())?,
            unseen: open.count(&and([scope.clone(), unseen]).into_query_text())?,
            recent: open.count(&and([scope, recent]).into_query_text())?,
        })
    }

    async fn search(&self, mailbox: &MailboxDescriptor, query: &MailboxQuery) -> Result<Vec<Uid>> {
        let open = self.readable().await?;
        let text = and([render_query(&mailbox.query)?, render_query(query)?]).into_query_text();
        Ok(open.hits(&text)?.into_iter().map(|hit| hit.uid).collect())
    }

    async fn search_by_keys(
        &self,
        mailbox: &MailboxDescriptor,
        keys: &[SearchKey],
    ) -> Result<Vec<Uid>> {
        let open = self.readable().await?;
        let hits = self.key_hits(&open, mailbox, keys)?;
        Ok(hits.into_iter().map(|hit| hit.uid).collect())
    }

    async fn try_query(&self, raw: &str) -> Result<()> {
        self.live()?.parse(raw).map(|_| ())
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

        info!(
            old = %self.old_path.display(),
            "Moved tantivy index aside for rebuild"
        );
        Ok(())
    }

    async fn finish_rebuild(&self, committed: bool) -> Result<()> {
        if let Ok(open) = self.live() {
            if open.writer.is_some() {
                self.pending_chars.store(0, Ordering::SeqCst);
                commit(&open).await?;
            }
        }

        let old = self.old.write().map_err(poisoned)?.take();
        drop(old);

        let old_exists = tokio::fs::try_exists(&self.old_path).await?;
        if committed && old_exists {
            tokio::fs::remove_dir_all(&self.old_path).await?;
            debug!(path = %self.old_path.display(), "Removed old index");
        } else if !committed && old_exists {
            warn!(path = %self.old_path.display(), "Rebuild rolled back, old index left on disk");
        }

        self.rebuild.finish(committed)
    }

    async fn get_old_flags(&self, uid: Uid) -> Result<Option<String>> {
        let old = self.old.read().map_err(poisoned)?.clone();
        let old = old.ok_or(Error::NoOldIndex)?;
        Ok(old.find(uid)?.and_then(|doc| old.stored_flags(&doc)))
    }

    fn rebuild_state(&self) -> RebuildState {
        self.rebuild.state()
    }
}
