//! Pluggable search index
//!
//! Every engine implements [`SearchBackend`]. Mailboxes are scoped by a
//! [`MailboxQuery`] that is conjoined with every fetch, status and search,
//! and all list results are ordered ascending by UID.

pub mod key;
pub mod rebuild;
pub mod registry;
pub mod sqlite;
pub mod tantivy;

#[cfg(test)]
mod conformance;

pub use key::SearchKey;
pub use rebuild::{rebuild, RebuildTracker};
pub use registry::{BackendFactory, BackendRegistry};
pub use self::sqlite::SqliteBackend;
pub use self::tantivy::TantivyBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailidx_common::types::{
    FlagTarget, IndexedItem, ItemId, MailboxDescriptor, MailboxId, MailboxQuery, MailboxStatus,
    MessageDocument, OpenMode, RebuildState, SequenceItem, SequenceSet, Uid,
};
use mailidx_common::Result;
use std::collections::BTreeSet;

/// Contract shared by all index engines
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Engine name as used in configuration
    fn name(&self) -> &'static str;

    /// Create the physical index if it does not exist yet
    async fn setup(&self) -> Result<()>;

    async fn open(&self, mode: OpenMode) -> Result<()>;

    /// Release the index; safe after a failed `open`
    async fn close(&self) -> Result<()>;

    /// Acquire auxiliary resources such as a side flag table
    async fn standby(&self) -> Result<()>;

    /// Release what `standby` acquired
    async fn relax(&self) -> Result<()>;

    /// Scoping query for a regular mailbox
    fn default_query(&self, mailbox_id: MailboxId) -> MailboxQuery;

    /// Scoping query for a mailing-list folder
    fn list_query(&self, ml_name: &str) -> MailboxQuery;

    /// Index a new document and initialise its flags
    async fn register(&self, document: &MessageDocument, location: &str) -> Result<ItemId>;

    async fn get_uid(&self, item_id: ItemId) -> Result<Uid>;

    /// `None` when the message is unknown or its flags were deleted
    async fn get_flags(&self, target: FlagTarget) -> Result<Option<String>>;

    async fn set_flags(&self, target: FlagTarget, flags: &str) -> Result<()>;

    async fn delete_flags(&self, target: FlagTarget) -> Result<()>;

    /// Remove a document and its flags
    async fn delete(&self, uid: Uid, item_id: ItemId) -> Result<()>;

    /// Resolve sequence numbers against the UID-ordered mailbox contents
    async fn fetch(&self, mailbox: &MailboxDescriptor, set: &SequenceSet)
        -> Result<Vec<IndexedItem>>;

    /// Resolve UIDs; `n:*` means every UID from `n` upwards
    async fn uid_fetch(
        &self,
        mailbox: &MailboxDescriptor,
        set: &SequenceSet,
    ) -> Result<Vec<IndexedItem>>;

    async fn status(&self, mailbox: &MailboxDescriptor) -> Result<MailboxStatus>;

    /// Run an already compiled query inside the mailbox scope
    async fn search(&self, mailbox: &MailboxDescriptor, query: &MailboxQuery) -> Result<Vec<Uid>>;

    /// Compile and run search keys (implicitly AND-ed) inside the mailbox scope
    async fn search_by_keys(&self, mailbox: &MailboxDescriptor, keys: &[SearchKey])
        -> Result<Vec<Uid>>;

    /// Validate a raw engine-native query string
    async fn try_query(&self, raw: &str) -> Result<()>;

    /// Move the live index aside and start a fresh one
    async fn begin_rebuild(&self, mode: OpenMode) -> Result<()>;

    /// Drop the old index, deleting it from storage when `committed`
    async fn finish_rebuild(&self, committed: bool) -> Result<()>;

    /// Flags a UID had in the index being rebuilt; `NoOldIndex` outside a rebuild
    async fn get_old_flags(&self, uid: Uid) -> Result<Option<String>>;

    fn rebuild_state(&self) -> RebuildState;
}

/// One document matched by a backend query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hit {
    pub uid: Uid,
    pub item_id: ItemId,
    pub internal_date: DateTime<Utc>,
}

impl Hit {
    fn item(&self, sequence_number: u64) -> IndexedItem {
        IndexedItem {
            sequence_number,
            uid: self.uid,
            item_id: self.item_id,
            internal_date: self.internal_date,
        }
    }
}

/// Pick sequence numbers out of UID-ordered `hits`.
///
/// Numbers outside `1..=hits.len()` are skipped, inverted ranges select
/// nothing, and the result is ascending however the set was written.
pub(crate) fn select_by_sequence(hits: &[Hit], set: &SequenceSet) -> Vec<IndexedItem> {
    let count = hits.len() as u64;
    let mut selected = BTreeSet::new();

    for item in set.items() {
        match *item {
            SequenceItem::Number(n) => {
                if (1..=count).contains(&n) {
                    selected.insert(n);
                }
            }
            SequenceItem::Last => {
                if count > 0 {
                    selected.insert(count);
                }
            }
            SequenceItem::Range(first, last) => {
                let last = last.unwrap_or(count).min(count);
                selected.extend(first.max(1)..=last);
            }
        }
    }

    selected
        .into_iter()
        .map(|n| hits[(n - 1) as usize].item(n))
        .collect()
}

/// Items for a UID fetch, numbered by their own UID
pub(crate) fn uid_items(hits: &[Hit]) -> Vec<IndexedItem> {
    hits.iter().map(|hit| hit.item(hit.uid)).collect()
}

/// Epoch seconds to a UTC timestamp, clamping garbage to the epoch
pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}
