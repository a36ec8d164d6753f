//! Index rebuild with fallback to the previous index for flag migration
//!
//! `Live -> Swapping -> Rebuilding -> Committed | RolledBack`. The backend
//! moves its index aside in `begin_rebuild`, the caller's body re-registers
//! every message (consulting `get_old_flags`), and `finish_rebuild` either
//! deletes the old index or leaves the partial new one live.

use super::SearchBackend;
use mailidx_common::types::{OpenMode, RebuildState};
use mailidx_common::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// State holder each backend embeds
#[derive(Debug)]
pub struct RebuildTracker {
    state: Mutex<RebuildState>,
}

impl Default for RebuildTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RebuildTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RebuildState::Live),
        }
    }

    pub fn state(&self) -> RebuildState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RebuildState::RolledBack)
    }

    fn transition(&self, allowed: &[RebuildState], next: RebuildState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("rebuild state lock poisoned".to_string()))?;
        if !allowed.contains(&state) {
            return Err(Error::Internal(format!(
                "invalid rebuild transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    /// Enter `Swapping`; fails while another rebuild is in progress
    pub fn begin(&self) -> Result<()> {
        self.transition(
            &[
                RebuildState::Live,
                RebuildState::Committed,
                RebuildState::RolledBack,
            ],
            RebuildState::Swapping,
        )
    }

    pub fn rebuilding(&self) -> Result<()> {
        self.transition(&[RebuildState::Swapping], RebuildState::Rebuilding)
    }

    pub fn finish(&self, committed: bool) -> Result<()> {
        let next = if committed {
            RebuildState::Committed
        } else {
            RebuildState::RolledBack
        };
        self.transition(&[RebuildState::Swapping, RebuildState::Rebuilding], next)
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.state(),
            RebuildState::Swapping | RebuildState::Rebuilding
        )
    }
}

/// Run the rebuild protocol around `body`.
///
/// A failing body leaves the new, possibly partial, index live and its
/// error is returned unchanged. Nothing is retried.
pub async fn rebuild<F, Fut>(backend: Arc<dyn SearchBackend>, mode: OpenMode, body: F) -> Result<()>
where
    F: FnOnce(Arc<dyn SearchBackend>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(engine = backend.name(), "Rebuilding index");
    backend.begin_rebuild(mode).await?;

    match body(Arc::clone(&backend)).await {
        Ok(()) => {
            backend.finish_rebuild(true).await?;
            info!(engine = backend.name(), "Index rebuild committed");
            Ok(())
        }
        Err(e) => {
            warn!(engine = backend.name(), "Index rebuild failed: {}", e);
            if let Err(finish_err) = backend.finish_rebuild(false).await {
                error!("Failed to release old index: {}", finish_err);
            }
            Err(e)
        }
    }
}
