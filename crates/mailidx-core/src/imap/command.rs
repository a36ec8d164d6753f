//! IMAP Command definitions
//!
//! Defines the IMAP subset this server understands.

use crate::index::SearchKey;
use mailidx_common::types::SequenceSet;

/// IMAP command tag (client-provided identifier)
pub type Tag = String;

/// FETCH data items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    InternalDate,
    Uid,
    /// FLAGS INTERNALDATE
    All,
    /// FLAGS INTERNALDATE
    Fast,
}

impl FetchItem {
    /// Parse a single fetch item
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "FLAGS" => Some(FetchItem::Flags),
            "INTERNALDATE" => Some(FetchItem::InternalDate),
            "UID" => Some(FetchItem::Uid),
            "ALL" => Some(FetchItem::All),
            "FAST" => Some(FetchItem::Fast),
            _ => None,
        }
    }

    /// Parse fetch items from a parenthesized list or single item.
    ///
    /// Returns `None` if any item is unknown.
    pub fn parse_list(s: &str) -> Option<Vec<Self>> {
        let s = s.trim();
        let content = match s.strip_prefix('(') {
            Some(rest) => rest.strip_suffix(')')?,
            None => s,
        };

        let items = content
            .split_whitespace()
            .map(Self::parse)
            .collect::<Option<Vec<_>>>()?;
        if items.is_empty() {
            return None;
        }
        Some(items)
    }

    /// Expand macros to their plain items
    pub fn expand(&self) -> &'static [FetchItem] {
        match self {
            FetchItem::Flags => &[FetchItem::Flags],
            FetchItem::InternalDate => &[FetchItem::InternalDate],
            FetchItem::Uid => &[FetchItem::Uid],
            FetchItem::All | FetchItem::Fast => &[FetchItem::Flags, FetchItem::InternalDate],
        }
    }
}

/// Store operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Replace flags
    Replace,
    /// Add flags
    Add,
    /// Remove flags
    Remove,
}

/// Data item and flag list of a STORE command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFlags {
    pub operation: StoreOperation,
    pub silent: bool,
    pub flags: Vec<String>,
}

/// IMAP Command
#[derive(Debug, Clone, PartialEq)]
pub enum ImapCommand {
    // Any state commands
    Capability,
    Noop,
    Logout,

    // Not authenticated state
    Login {
        username: String,
        password: String,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Status {
        mailbox: String,
        items: Vec<String>,
    },
    Close,

    // Selected state
    Fetch {
        sequence: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    /// Keys are implicitly AND-ed
    Search {
        keys: Vec<SearchKey>,
        uid: bool,
    },
    Store {
        sequence: SequenceSet,
        flags: StoreFlags,
        uid: bool,
    },

    Unknown {
        command: String,
    },
}

/// Parsed IMAP command with tag
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedCommand {
    pub tag: Tag,
    pub command: ImapCommand,
}
