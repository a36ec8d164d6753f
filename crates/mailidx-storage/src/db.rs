//! SQLite connection and pool management

use mailidx_common::config::SqliteConfig;
use mailidx_common::types::OpenMode;
use mailidx_common::{Error, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Database pool wrapper bound to one SQLite file
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open a pool on `path`; read-write mode creates the file if missing
    pub async fn open(path: &Path, mode: OpenMode, config: &SqliteConfig) -> Result<Self> {
        debug!(path = %path.display(), ?mode, "Opening SQLite database");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(mode == OpenMode::ReadWrite)
            .read_only(mode == OpenMode::ReadOnly)
            // Rollback journal, so a moved-aside file reopens read-only without side files
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(parse_synchronous(&config.synchronous)?);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::Database(format!("Failed to open {}: {}", path.display(), e))
            })?;

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run schema statements, one per element
    pub async fn apply_schema(&self, statements: &[&str]) -> Result<()> {
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Schema setup failed: {}", e)))?;
        }
        Ok(())
    }

    /// Close every pooled connection so the file can be moved
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_synchronous(value: &str) -> Result<SqliteSynchronous> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(SqliteSynchronous::Off),
        "normal" => Ok(SqliteSynchronous::Normal),
        "full" => Ok(SqliteSynchronous::Full),
        "extra" => Ok(SqliteSynchronous::Extra),
        other => Err(Error::Config(format!(
            "Unsupported synchronous setting: {}",
            other
        ))),
    }
}
