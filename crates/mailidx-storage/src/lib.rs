//! mailidx Storage - SQLite plumbing and persisted state
//!
//! This crate provides the SQLite pool wrapper shared by the SQLite index
//! backend, the side-table Flag Store, and the mail store's state file.

pub mod db;
pub mod flags;
pub mod state;

pub use db::SqliteDatabase;
pub use flags::{FlagStore, SqliteFlagStore};
pub use state::{StateFile, StoreState};
