//! Persisted mail store state: UID sequence and mailbox descriptors

use mailidx_common::types::{MailboxDescriptor, MailboxId, Uid};
use mailidx_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    /// Next UID to hand out
    pub next_uid: Uid,
    pub next_mailbox_id: MailboxId,
    #[serde(default)]
    pub mailboxes: Vec<MailboxDescriptor>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_uid: 1,
            next_mailbox_id: 1,
            mailboxes: Vec::new(),
        }
    }
}

/// JSON file holding a [`StoreState`]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, or the initial state if the file does not exist yet
    pub async fn load(&self) -> Result<StoreState> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(StoreState::default());
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_slice(&content).map_err(|e| {
            Error::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    /// Write the state through a temporary file and rename it into place
    pub async fn save(&self, state: &StoreState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Storage(format!("Failed to serialize state: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
