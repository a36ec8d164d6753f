//! Common types for mailidx

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message UID, unique across the whole index
pub type Uid = u64;

/// Backend-native identifier of an indexed document
pub type ItemId = u64;

/// Unique identifier for mailboxes
pub type MailboxId = u64;

/// One element of an IMAP sequence set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceItem {
    /// Single number
    Number(u64),
    /// `*`, the highest number in use
    Last,
    /// Inclusive range; `None` as upper bound means `n:*`
    Range(u64, Option<u64>),
}

impl SequenceItem {
    fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            Some((first, last)) => match (first, last) {
                ("*", "*") => Some(SequenceItem::Last),
                ("*", n) | (n, "*") => Some(SequenceItem::Range(n.parse().ok()?, None)),
                (a, b) => Some(SequenceItem::Range(a.parse().ok()?, Some(b.parse().ok()?))),
            },
            None if s == "*" => Some(SequenceItem::Last),
            None => s.parse().ok().map(SequenceItem::Number),
        }
    }

    /// Check if `n` is covered, `max` being the value `*` stands for
    pub fn contains(&self, n: u64, max: u64) -> bool {
        match *self {
            SequenceItem::Number(k) => n == k,
            SequenceItem::Last => n == max,
            SequenceItem::Range(first, None) => n >= first,
            SequenceItem::Range(first, Some(last)) => first <= n && n <= last,
        }
    }
}

/// Sequence set for message selection, e.g. `1,3:5,9:*`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSet(pub Vec<SequenceItem>);

impl SequenceSet {
    /// Parse a sequence set string
    pub fn parse(s: &str) -> Option<Self> {
        let items = s
            .split(',')
            .map(|p| SequenceItem::parse(p.trim()))
            .collect::<Option<Vec<_>>>()?;
        if items.is_empty() {
            return None;
        }
        Some(SequenceSet(items))
    }

    pub fn items(&self) -> &[SequenceItem] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check if a number is in this set
    pub fn contains(&self, n: u64, max: u64) -> bool {
        self.0.iter().any(|item| item.contains(n, max))
    }
}

impl From<Vec<SequenceItem>> for SequenceSet {
    fn from(items: Vec<SequenceItem>) -> Self {
        SequenceSet(items)
    }
}

/// Document properties a mailbox query or search key can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Property {
    Uid,
    Size,
    InternalDate,
    Date,
    Subject,
    From,
    To,
    Cc,
    Bcc,
    XMlName,
    XMailCount,
    MailboxId,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Uid => "uid",
            Property::Size => "size",
            Property::InternalDate => "internal-date",
            Property::Date => "date",
            Property::Subject => "subject",
            Property::From => "from",
            Property::To => "to",
            Property::Cc => "cc",
            Property::Bcc => "bcc",
            Property::XMlName => "x-ml-name",
            Property::XMailCount => "x-mail-count",
            Property::MailboxId => "mailbox-id",
        }
    }

    /// Header names usable in a HEADER search key
    pub fn from_header(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "subject" => Some(Property::Subject),
            "from" => Some(Property::From),
            "to" => Some(Property::To),
            "cc" => Some(Property::Cc),
            "bcc" => Some(Property::Bcc),
            "x-ml-name" => Some(Property::XMlName),
            "x-mail-count" => Some(Property::XMailCount),
            _ => None,
        }
    }

    /// Properties compared as integers (dates are epoch seconds)
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Property::Uid
                | Property::Size
                | Property::InternalDate
                | Property::Date
                | Property::XMailCount
                | Property::MailboxId
        )
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied by a [`Condition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    /// Case-insensitive substring
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Text(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Int(n) => write!(f, "{}", n),
            PropertyValue::Text(s) => f.write_str(s),
        }
    }
}

/// Attribute filter on a single document property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub property: Property,
    pub op: CmpOp,
    pub value: PropertyValue,
}

impl Condition {
    pub fn new(property: Property, op: CmpOp, value: PropertyValue) -> Self {
        Self { property, op, value }
    }

    pub fn int(property: Property, op: CmpOp, value: i64) -> Self {
        Self::new(property, op, PropertyValue::Int(value))
    }

    pub fn text(property: Property, op: CmpOp, value: impl Into<String>) -> Self {
        Self::new(property, op, PropertyValue::Text(value.into()))
    }
}

/// A backend query fragment: free-text `main` part plus attribute filters.
///
/// Backends with a single textual query language keep everything in `main`
/// and leave `sub` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxQuery {
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub sub: Vec<Condition>,
}

impl MailboxQuery {
    pub fn new(main: impl Into<String>, sub: Vec<Condition>) -> Self {
        Self {
            main: main.into(),
            sub,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.main.trim().is_empty() && self.sub.is_empty()
    }

    /// Conjoin `other` into `self`, joining main parts with `joiner`
    pub fn merge(&mut self, other: &MailboxQuery, joiner: &str) {
        let main = other.main.trim();
        if !main.is_empty() {
            if self.main.trim().is_empty() {
                self.main = main.to_string();
            } else {
                self.main = format!("{}{}{}", self.main.trim(), joiner, main);
            }
        }
        self.sub.extend(other.sub.iter().cloned());
    }
}

/// A mailbox as seen by the index layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDescriptor {
    pub id: MailboxId,
    pub name: String,
    /// Scoping query conjoined with every operation on this mailbox
    pub query: MailboxQuery,
    /// UIDs above this watermark count as recent
    #[serde(default)]
    pub last_peeked_uid: Uid,
}

/// A message as handed to a backend for indexing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDocument {
    pub uid: Uid,
    pub mailbox_id: MailboxId,
    pub size: u64,
    pub internal_date: DateTime<Utc>,
    pub date: Option<DateTime<Utc>>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub x_ml_name: Option<String>,
    pub x_mail_count: Option<u64>,
    pub body: String,
    /// Space separated flags, e.g. `\Seen \Answered $Work`
    pub flags: String,
}

impl MessageDocument {
    /// Create an empty document carrying only its identity
    pub fn new(uid: Uid, mailbox_id: MailboxId, internal_date: DateTime<Utc>) -> Self {
        Self {
            uid,
            mailbox_id,
            size: 0,
            internal_date,
            date: None,
            subject: String::new(),
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            bcc: String::new(),
            x_ml_name: None,
            x_mail_count: None,
            body: String::new(),
            flags: String::new(),
        }
    }
}

/// Ephemeral view of one message produced by fetch and search calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedItem {
    /// Sequence number for `fetch`, the UID itself for `uid_fetch`
    pub sequence_number: u64,
    pub uid: Uid,
    pub item_id: ItemId,
    pub internal_date: DateTime<Utc>,
}

/// Mailbox counters computed on demand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub messages: u64,
    pub unseen: u64,
    pub recent: u64,
}

/// Access mode for opening an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Addresses a flag entry by UID or by backend item id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTarget {
    Uid(Uid),
    Item(ItemId),
}

/// Phases of the index rebuild protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildState {
    Live,
    Swapping,
    Rebuilding,
    Committed,
    RolledBack,
}
