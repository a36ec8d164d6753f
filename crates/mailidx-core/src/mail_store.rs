//! Mail store - owns the search backend and the persisted mailbox state
//!
//! Every index mutation runs under one coarse lock. The shutdown sweep takes
//! the same lock, so a session is never cancelled halfway through a write.

use crate::index::{self, SearchBackend, SearchKey};
use chrono::{DateTime, Utc};
use mail_parser::{Address, Message, MessageParser};
use mailidx_common::config::IndexConfig;
use mailidx_common::flags;
use mailidx_common::types::{
    FlagTarget, IndexedItem, MailboxDescriptor, MailboxId, MailboxQuery, MailboxStatus,
    MessageDocument, OpenMode, SequenceItem, SequenceSet, Uid,
};
use mailidx_common::{Error, Result};
use mailidx_storage::{StateFile, StoreState};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Name of the mailbox every store starts with
pub const INBOX: &str = "INBOX";

pub struct MailStore {
    backend: Arc<dyn SearchBackend>,
    lock: RwLock<()>,
    state: Mutex<StoreState>,
    state_file: StateFile,
}

impl MailStore {
    /// Prepare the index for use and load the persisted state
    pub async fn open(config: &IndexConfig, backend: Arc<dyn SearchBackend>) -> Result<Self> {
        backend.setup().await?;
        backend.standby().await?;
        backend.open(OpenMode::ReadWrite).await?;

        let state_file = StateFile::new(config.data_dir.join("state.json"));
        let state = state_file.load().await?;

        let store = Self {
            backend,
            lock: RwLock::new(()),
            state: Mutex::new(state),
            state_file,
        };

        if store.mailbox(INBOX).await.is_none() {
            store.create_mailbox(INBOX).await?;
        }

        info!(
            engine = store.backend.name(),
            path = %store.state_file.path().display(),
            "Mail store opened"
        );
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    /// Exclusive guard serializing index mutations
    pub async fn synchronize(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Shared guard for reads; excludes mutations and rebuilds
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    pub async fn mailboxes(&self) -> Vec<MailboxDescriptor> {
        self.state.lock().await.mailboxes.clone()
    }

    /// Look a mailbox up by name; `INBOX` is case-insensitive
    pub async fn mailbox(&self, name: &str) -> Option<MailboxDescriptor> {
        let state = self.state.lock().await;
        find(&state, name).cloned()
    }

    pub async fn create_mailbox(&self, name: &str) -> Result<MailboxDescriptor> {
        let backend = Arc::clone(&self.backend);
        self.add_mailbox(name, |id| backend.default_query(id)).await
    }

    /// Create a folder holding every message of one mailing list
    pub async fn create_list_mailbox(&self, name: &str, ml_name: &str) -> Result<MailboxDescriptor> {
        let query = self.backend.list_query(ml_name);
        self.add_mailbox(name, move |_| query).await
    }

    /// Create a folder defined by a raw backend query; the query must parse
    pub async fn create_query_mailbox(&self, name: &str, raw: &str) -> Result<MailboxDescriptor> {
        {
            let _guard = self.shared().await;
            self.backend.try_query(raw).await?;
        }
        let query = MailboxQuery::new(raw, Vec::new());
        self.add_mailbox(name, move |_| query).await
    }

    /// Delete `name` and every mailbox below it. Messages stay indexed.
    pub async fn delete_mailbox(&self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(INBOX) {
            return Err(Error::Storage("INBOX cannot be deleted".to_string()));
        }

        let mut state = self.state.lock().await;
        let before = state.mailboxes.len();
        state.mailboxes.retain(|m| !in_subtree(&m.name, name));
        let deleted = before - state.mailboxes.len();
        if deleted == 0 {
            return Err(Error::Storage(format!("no such mailbox: {}", name)));
        }
        self.state_file.save(&state).await?;

        info!(mailbox = %name, deleted, "Deleted mailbox");
        Ok(())
    }

    /// Rename `name` to `new_name`, carrying the mailboxes below it along
    pub async fn rename_mailbox(&self, name: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::Storage("mailbox name is empty".to_string()));
        }
        if name.eq_ignore_ascii_case(INBOX) {
            return Err(Error::Storage("INBOX cannot be renamed".to_string()));
        }

        let mut state = self.state.lock().await;
        if find(&state, new_name).is_some() {
            return Err(Error::Storage(format!("mailbox {} already exists", new_name)));
        }

        let renamed: Vec<(usize, String)> = state
            .mailboxes
            .iter()
            .enumerate()
            .filter(|(_, m)| in_subtree(&m.name, name))
            .map(|(i, m)| (i, format!("{}{}", new_name, &m.name[name.len()..])))
            .collect();
        if renamed.is_empty() {
            return Err(Error::Storage(format!("no such mailbox: {}", name)));
        }
        if let Some((_, taken)) = renamed.iter().find(|(_, n)| find(&state, n).is_some()) {
            return Err(Error::Storage(format!("mailbox {} already exists", taken)));
        }

        for (i, renamed_to) in renamed {
            state.mailboxes[i].name = renamed_to;
        }
        self.state_file.save(&state).await?;

        info!(from = %name, to = %new_name, "Renamed mailbox");
        Ok(())
    }

    async fn add_mailbox<F>(&self, name: &str, query: F) -> Result<MailboxDescriptor>
    where
        F: FnOnce(MailboxId) -> MailboxQuery,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Storage("mailbox name is empty".to_string()));
        }

        let mut state = self.state.lock().await;
        if find(&state, name).is_some() {
            return Err(Error::Storage(format!("mailbox {} already exists", name)));
        }

        let id = state.next_mailbox_id;
        let mailbox = MailboxDescriptor {
            id,
            name: name.to_string(),
            query: query(id),
            last_peeked_uid: 0,
        };
        state.next_mailbox_id += 1;
        state.mailboxes.push(mailbox.clone());
        self.state_file.save(&state).await?;

        info!(mailbox = %mailbox.name, id, "Created mailbox");
        Ok(mailbox)
    }

    pub async fn open_index(&self, mode: OpenMode) -> Result<()> {
        let _guard = self.synchronize().await;
        self.backend.open(mode).await
    }

    /// Close the index and release the flag store
    pub async fn close_index(&self) -> Result<()> {
        let _guard = self.synchronize().await;
        self.backend.close().await?;
        self.backend.relax().await
    }

    /// Parse and index a raw RFC 822 message, returning its new UID
    pub async fn deliver(&self, mailbox: &str, raw: &[u8], flags: &str) -> Result<Uid> {
        let _guard = self.synchronize().await;
        let mut state = self.state.lock().await;

        let mailbox = find(&state, mailbox)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no such mailbox: {}", mailbox)))?;

        let uid = state.next_uid;
        let mut document = parse_message(raw, Utc::now())?;
        document.uid = uid;
        document.mailbox_id = mailbox.id;
        document.flags = flags::normalize(flags);

        self.backend
            .register(&document, &format!("{}/{}", mailbox.id, uid))
            .await?;

        state.next_uid += 1;
        self.state_file.save(&state).await?;

        debug!(uid, mailbox = %mailbox.name, "Delivered message");
        Ok(uid)
    }

    /// Replace the flags of one message
    pub async fn store_flags(&self, uid: Uid, flags: &str) -> Result<()> {
        let _guard = self.synchronize().await;
        self.backend
            .set_flags(FlagTarget::Uid(uid), &flags::normalize(flags))
            .await
    }

    /// Remove every `\Deleted` message of `mailbox`, returning the removed UIDs
    pub async fn expunge(&self, mailbox: &MailboxDescriptor) -> Result<Vec<Uid>> {
        let _guard = self.synchronize().await;

        let all = SequenceSet(vec![SequenceItem::Range(1, None)]);
        let items = self.backend.uid_fetch(mailbox, &all).await?;

        let mut removed = Vec::new();
        for item in items {
            let current = self
                .backend
                .get_flags(FlagTarget::Item(item.item_id))
                .await?
                .unwrap_or_default();
            if flags::contains(&current, flags::DELETED) {
                self.backend.delete(item.uid, item.item_id).await?;
                removed.push(item.uid);
            }
        }

        if !removed.is_empty() {
            info!(mailbox = %mailbox.name, count = removed.len(), "Expunged messages");
        }
        Ok(removed)
    }

    /// Status of `name` as of now; later calls no longer count these messages as recent
    pub async fn peek(&self, name: &str) -> Result<MailboxStatus> {
        let mailbox = self
            .mailbox(name)
            .await
            .ok_or_else(|| Error::Storage(format!("no such mailbox: {}", name)))?;

        let status = {
            let _guard = self.shared().await;
            self.backend.status(&mailbox).await?
        };

        let mut state = self.state.lock().await;
        let watermark = state.next_uid.saturating_sub(1);
        if let Some(entry) = state.mailboxes.iter_mut().find(|m| m.id == mailbox.id) {
            if entry.last_peeked_uid < watermark {
                entry.last_peeked_uid = watermark;
                self.state_file.save(&state).await?;
            }
        }
        Ok(status)
    }

    /// Counters without moving the recent watermark
    pub async fn status(&self, mailbox: &MailboxDescriptor) -> Result<MailboxStatus> {
        let _guard = self.shared().await;
        self.backend.status(mailbox).await
    }

    /// Resolve a sequence set, or a UID set when `uid` is true
    pub async fn fetch(
        &self,
        mailbox: &MailboxDescriptor,
        set: &SequenceSet,
        uid: bool,
    ) -> Result<Vec<IndexedItem>> {
        let _guard = self.shared().await;
        if uid {
            self.backend.uid_fetch(mailbox, set).await
        } else {
            self.backend.fetch(mailbox, set).await
        }
    }

    pub async fn flags(&self, item: &IndexedItem) -> Result<String> {
        let _guard = self.shared().await;
        Ok(self
            .backend
            .get_flags(FlagTarget::Item(item.item_id))
            .await?
            .unwrap_or_default())
    }

    /// UID the next delivered message will get
    pub async fn next_uid(&self) -> Uid {
        self.state.lock().await.next_uid
    }

    /// Run search keys against `mailbox` under the shared lock
    pub async fn search(&self, mailbox: &MailboxDescriptor, keys: &[SearchKey]) -> Result<Vec<Uid>> {
        let _guard = self.shared().await;
        self.backend.search_by_keys(mailbox, keys).await
    }

    /// Rebuild the whole index; `body` re-registers every message
    pub async fn rebuild_index<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn SearchBackend>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.synchronize().await;
        index::rebuild(Arc::clone(&self.backend), OpenMode::ReadWrite, body).await
    }
}

fn find<'a>(state: &'a StoreState, name: &str) -> Option<&'a MailboxDescriptor> {
    state.mailboxes.iter().find(|m| {
        if name.eq_ignore_ascii_case(INBOX) {
            m.name.eq_ignore_ascii_case(INBOX)
        } else {
            m.name == name
        }
    })
}

/// Whether `candidate` is `name` itself or one of its `name/...` children
fn in_subtree(candidate: &str, name: &str) -> bool {
    candidate == name
        || candidate
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Build an index document from raw message bytes. Identity fields are left
/// for the caller to fill in.
pub fn parse_message(raw: &[u8], internal_date: DateTime<Utc>) -> Result<MessageDocument> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::Storage("unparseable message".to_string()))?;

    let mut document = MessageDocument::new(0, 0, internal_date);
    document.size = raw.len() as u64;
    document.date = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));
    document.subject = message.subject().unwrap_or_default().to_string();
    document.from = addresses(message.from());
    document.to = addresses(message.to());
    document.cc = addresses(message.cc());
    document.bcc = addresses(message.bcc());
    document.x_ml_name = raw_header(&message, "X-ML-Name");
    document.x_mail_count = raw_header(&message, "X-Mail-Count").and_then(|v| v.parse().ok());
    document.body = message
        .body_text(0)
        .map(|b| b.into_owned())
        .unwrap_or_default();

    Ok(document)
}

fn addresses(address: Option<&Address<'_>>) -> String {
    let Some(address) = address else {
        return String::new();
    };
    address
        .iter()
        .map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(email)) => format!("{} <{}>", name, email),
            (None, Some(email)) => email.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn raw_header(message: &Message<'_>, name: &'static str) -> Option<String> {
    message
        .header_raw(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
