//! IMAP Response generation
//!
//! Generates IMAP4 response strings for client communication.

use chrono::{DateTime, Utc};
use mailidx_common::flags;

/// Flags every mailbox supports
pub const SYSTEM_FLAGS: &[&str] = &[
    flags::ANSWERED,
    flags::FLAGGED,
    flags::DELETED,
    flags::SEEN,
    flags::DRAFT,
];

/// IMAP Response builder
pub struct ImapResponse;

impl ImapResponse {
    /// Server greeting
    pub fn greeting(hostname: &str) -> String {
        format!(
            "* OK [CAPABILITY IMAP4rev1 LOGIN] {} mailidx IMAP server ready\r\n",
            hostname
        )
    }

    /// Tagged OK response
    pub fn ok(tag: &str, message: &str) -> String {
        format!("{} OK {}\r\n", tag, message)
    }

    /// Tagged NO response
    pub fn no(tag: &str, message: &str) -> String {
        format!("{} NO {}\r\n", tag, message)
    }

    /// Tagged BAD response
    pub fn bad(tag: &str, message: &str) -> String {
        format!("{} BAD {}\r\n", tag, message)
    }

    /// Untagged BYE response
    pub fn bye(message: &str) -> String {
        format!("* BYE {}\r\n", message)
    }

    /// Sent instead of a greeting when the session ceiling is reached
    pub fn too_many_clients() -> String {
        Self::bye("too many clients")
    }

    pub fn capability() -> String {
        "* CAPABILITY IMAP4rev1 LOGIN\r\n".to_string()
    }

    pub fn mailbox_flags() -> String {
        format!("* FLAGS ({})\r\n", SYSTEM_FLAGS.join(" "))
    }

    pub fn permanent_flags() -> String {
        format!(
            "* OK [PERMANENTFLAGS ({} \\*)] Limited\r\n",
            SYSTEM_FLAGS.join(" ")
        )
    }

    pub fn exists(count: u64) -> String {
        format!("* {} EXISTS\r\n", count)
    }

    pub fn recent(count: u64) -> String {
        format!("* {} RECENT\r\n", count)
    }

    pub fn uid_validity(validity: u64) -> String {
        format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", validity)
    }

    pub fn uid_next(next: u64) -> String {
        format!("* OK [UIDNEXT {}] Predicted next UID\r\n", next)
    }

    /// STATUS response
    pub fn status(mailbox: &str, items: &[(String, u64)]) -> String {
        let items_str: Vec<String> = items.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        format!("* STATUS \"{}\" ({})\r\n", mailbox, items_str.join(" "))
    }

    /// FETCH response
    pub fn fetch(seq: u64, items: &[(String, String)]) -> String {
        let items_str: Vec<String> = items.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        format!("* {} FETCH ({})\r\n", seq, items_str.join(" "))
    }

    /// SEARCH response
    pub fn search(numbers: &[u64]) -> String {
        if numbers.is_empty() {
            "* SEARCH\r\n".to_string()
        } else {
            let numbers: Vec<String> = numbers.iter().map(|n| n.to_string()).collect();
            format!("* SEARCH {}\r\n", numbers.join(" "))
        }
    }

    /// Parenthesised flag list for FETCH
    pub fn format_flags(message_flags: &str) -> String {
        format!("({})", flags::normalize(message_flags))
    }

    /// Format internal date for FETCH
    pub fn format_internal_date(dt: &DateTime<Utc>) -> String {
        format!("\"{}\"", dt.format("%d-%b-%Y %H:%M:%S %z"))
    }
}
