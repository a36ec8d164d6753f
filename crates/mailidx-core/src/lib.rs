//! mailidx Core - search index backends and the IMAP front end
//!
//! This crate provides the pluggable full-text index backends, the IMAP
//! search-key compiler, the rebuild protocol and the IMAP session lifecycle
//! (admission and graceful shutdown) on top of the mail store.

pub mod imap;
pub mod index;
pub mod mail_store;

pub use imap::{ImapServer, SessionManager};
pub use index::{BackendRegistry, SearchBackend, SearchKey};
pub use mail_store::MailStore;
