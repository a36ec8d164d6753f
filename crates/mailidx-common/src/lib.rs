//! mailidx Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy and the data model
//! shared by the storage layer, the index backends and the daemon.

pub mod config;
pub mod error;
pub mod flags;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
