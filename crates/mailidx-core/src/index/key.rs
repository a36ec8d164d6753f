//! Search-key AST shared by every backend
//!
//! A [`SearchKey`] is built once per SEARCH command. Each backend owns a
//! compile function that turns keys into its native query; the helpers here
//! hold the parts both backends agree on (date spans, attribute conditions,
//! flag predicates).

use chrono::{NaiveDate, NaiveTime};
use mailidx_common::flags;
use mailidx_common::types::{CmpOp, Condition, Property, SequenceItem, SequenceSet};
use mailidx_common::{Error, Result};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    /// Matches everything
    All,
    Body(String),
    /// Substring match for subject/from/to/cc/bcc, exact for x-ml-name/x-mail-count
    Header(Property, String),
    Flag(String),
    NoFlag(String),
    Keyword(String),
    NoKeyword(String),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Larger(u64),
    Smaller(u64),
    SequenceNumber(SequenceSet),
    Uid(SequenceSet),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Group(Vec<SearchKey>),
}

impl SearchKey {
    pub fn not(key: SearchKey) -> Self {
        SearchKey::Not(Box::new(key))
    }

    pub fn or(a: SearchKey, b: SearchKey) -> Self {
        SearchKey::Or(Box::new(a), Box::new(b))
    }

    /// Attribute conditions for keys expressible as plain filters.
    ///
    /// Returns `Ok(None)` for keys that are not attribute filters.
    pub fn conditions(&self) -> Result<Option<Vec<Condition>>> {
        let conditions = match self {
            SearchKey::Header(property, value) => match property {
                Property::Subject
                | Property::From
                | Property::To
                | Property::Cc
                | Property::Bcc => {
                    if value.is_empty() {
                        Vec::new()
                    } else {
                        vec![Condition::text(*property, CmpOp::Contains, value.clone())]
                    }
                }
                Property::XMlName => vec![Condition::text(*property, CmpOp::Eq, value.clone())],
                Property::XMailCount => {
                    let count: i64 = value.trim().parse().map_err(|_| {
                        Error::InvalidQuery(format!("x-mail-count is not a number: {}", value))
                    })?;
                    vec![Condition::int(*property, CmpOp::Eq, count)]
                }
                _ => Vec::new(),
            },
            SearchKey::Before(date) => {
                vec![Condition::int(Property::InternalDate, CmpOp::Lt, day_start(*date))]
            }
            SearchKey::On(date) => day_conditions(Property::InternalDate, *date),
            SearchKey::Since(date) => {
                vec![Condition::int(Property::InternalDate, CmpOp::Ge, day_start(*date))]
            }
            SearchKey::SentBefore(date) => {
                vec![Condition::int(Property::Date, CmpOp::Lt, day_start(*date))]
            }
            SearchKey::SentOn(date) => day_conditions(Property::Date, *date),
            SearchKey::SentSince(date) => {
                vec![Condition::int(Property::Date, CmpOp::Ge, day_start(*date))]
            }
            SearchKey::Larger(size) => vec![Condition::int(Property::Size, CmpOp::Gt, *size as i64)],
            SearchKey::Smaller(size) => {
                vec![Condition::int(Property::Size, CmpOp::Lt, *size as i64)]
            }
            _ => return Ok(None),
        };
        Ok(Some(conditions))
    }

    /// For flag predicates, whether a message with `message_flags` is selected
    pub fn flag_matches(&self, message_flags: &str) -> Option<bool> {
        match self {
            SearchKey::Flag(flag) | SearchKey::Keyword(flag) => {
                Some(flags::contains(message_flags, flag))
            }
            SearchKey::NoFlag(flag) | SearchKey::NoKeyword(flag) => {
                Some(!flags::contains(message_flags, flag))
            }
            _ => None,
        }
    }

    /// Whether any UID set below this key refers to `*`
    pub fn uses_last_uid(&self) -> bool {
        match self {
            SearchKey::Uid(set) => set
                .items()
                .iter()
                .any(|item| matches!(item, SequenceItem::Last)),
            SearchKey::Not(key) => key.uses_last_uid(),
            SearchKey::Or(a, b) => a.uses_last_uid() || b.uses_last_uid(),
            SearchKey::Group(keys) => keys.iter().any(SearchKey::uses_last_uid),
            _ => false,
        }
    }

    /// `(property, needle)` for a non-empty header substring key
    pub fn substring(&self) -> Option<(Property, &str)> {
        match self {
            SearchKey::Header(
                property @ (Property::Subject
                | Property::From
                | Property::To
                | Property::Cc
                | Property::Bcc),
                value,
            ) if !value.is_empty() => Some((*property, value.as_str())),
            _ => None,
        }
    }

    /// Whether any key below this one is a header substring key
    pub fn has_substring(&self) -> bool {
        match self {
            SearchKey::Not(key) => key.has_substring(),
            SearchKey::Or(a, b) => a.has_substring() || b.has_substring(),
            SearchKey::Group(keys) => keys.iter().any(SearchKey::has_substring),
            key => key.substring().is_some(),
        }
    }

    /// Fail on keys no backend can evaluate
    pub fn ensure_supported(&self) -> Result<()> {
        match self {
            SearchKey::SequenceNumber(_) => Err(Error::NotImplemented(
                "sequence number search is not implemented".to_string(),
            )),
            SearchKey::Not(key) => key.ensure_supported(),
            SearchKey::Or(a, b) => {
                a.ensure_supported()?;
                b.ensure_supported()
            }
            SearchKey::Group(keys) => keys.iter().try_for_each(SearchKey::ensure_supported),
            _ => Ok(()),
        }
    }
}

/// Whether `text` carries anything a full-text index would tokenize
pub fn has_terms(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

/// Case-insensitive substring test with ASCII folding, as sqlite `lower()` does
pub fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Epoch seconds of 00:00:00 UTC on `date`
pub fn day_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// `[day start, next day start)` on `property`
fn day_conditions(property: Property, date: NaiveDate) -> Vec<Condition> {
    let start = day_start(date);
    vec![
        Condition::int(property, CmpOp::Ge, start),
        Condition::int(property, CmpOp::Lt, start + SECONDS_PER_DAY),
    ]
}

/// Parse an IMAP date such as `1-Feb-1994` or `"01-Feb-1994"`
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim().trim_matches('"');
    NaiveDate::parse_from_str(s, "%d-%b-%Y")
        .map_err(|_| Error::InvalidQuery(format!("invalid date string {}", s)))
}
