//! IMAP4 Server Module
//!
//! A minimal IMAP4rev1 front end over the mail store. Searches are compiled
//! into index queries by the configured backend.
//!
//! Supported commands:
//! - CAPABILITY, NOOP, LOGOUT
//! - LOGIN
//! - SELECT, EXAMINE, STATUS, CLOSE
//! - FETCH, SEARCH, STORE (and their UID forms)

pub mod command;
pub mod manager;
pub mod parser;
pub mod response;
pub mod server;
pub mod session;

pub use manager::SessionManager;
pub use server::ImapServer;
