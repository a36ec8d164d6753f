//! Session admission and graceful shutdown
//!
//! Every admitted connection runs in its own task, registered under its
//! session id until the task ends. Shutdown cancels each registered task
//! while holding the mail store's mutation lock, then waits for all of them.

use super::response::ImapResponse;
use crate::mail_store::MailStore;
use mailidx_common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

struct SessionEntry {
    peer: SocketAddr,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

type Registry = Arc<Mutex<HashMap<Uuid, SessionEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a session from the registry when its task ends, however it ends
struct RegistryGuard {
    registry: Registry,
    id: Uuid,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if let Some(entry) = lock(&self.registry).remove(&self.id) {
            debug!(session = %self.id, peer = %entry.peer, "Session unregistered");
        }
    }
}

pub struct SessionManager {
    max_clients: usize,
    store: Arc<MailStore>,
    sessions: Registry,
}

impl SessionManager {
    pub fn new(max_clients: usize, store: Arc<MailStore>) -> Self {
        Self {
            max_clients,
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start `serve` for a new connection, or refuse it when the ceiling is
    /// reached. A refused peer gets `* BYE too many clients` and
    /// `Error::TooManyClients` is returned; no session is registered.
    pub async fn admit<S, F, Fut>(&self, mut stream: S, peer: SocketAddr, serve: F) -> Result<Uuid>
    where
        S: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Uuid, S, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        {
            let mut sessions = lock(&self.sessions);
            if sessions.len() < self.max_clients {
                let id = Uuid::new_v4();
                let token = CancellationToken::new();
                let guard = RegistryGuard {
                    registry: Arc::clone(&self.sessions),
                    id,
                };
                let session = serve(id, stream, token.clone());
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    session.await
                });
                sessions.insert(
                    id,
                    SessionEntry {
                        peer,
                        token,
                        handle: Some(handle),
                    },
                );
                return Ok(id);
            }
        }

        info!("rejected connection from {}: too many clients", peer);
        stream
            .write_all(ImapResponse::too_many_clients().as_bytes())
            .await?;
        stream.shutdown().await?;
        Err(Error::TooManyClients)
    }

    /// Cancel every session and wait until all of them have ended
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, SocketAddr, JoinHandle<Result<()>>)> = {
            let _sync = self.store.synchronize().await;
            let mut sessions = lock(&self.sessions);
            sessions
                .iter_mut()
                .filter_map(|(id, entry)| {
                    entry.token.cancel();
                    entry.handle.take().map(|handle| (*id, entry.peer, handle))
                })
                .collect()
        };

        info!(count = handles.len(), "Cancelling sessions");

        for (id, peer, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {
                    debug!(session = %id, peer = %peer, "Session cancelled");
                }
                Ok(Err(e)) => {
                    error!(session = %id, peer = %peer, "Session failed during shutdown: {}", e);
                }
                Err(e) => {
                    error!(session = %id, peer = %peer, "Session task failed: {}", e);
                }
            }
        }

        info!("all sessions drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BackendRegistry;
    use mailidx_common::config::IndexConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt};

    async fn manager(temp_dir: &TempDir, max_clients: usize) -> SessionManager {
        let mut config = IndexConfig::default();
        config.engine = "sqlite".to_string();
        config.data_dir = temp_dir.path().to_path_buf();
        let backend = BackendRegistry::global().create(&config).unwrap();
        let store = MailStore::open(&config, backend).await.unwrap();
        SessionManager::new(max_clients, Arc::new(store))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn wait_until_empty(manager: &SessionManager) {
        for _ in 0..100 {
            if manager.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still registered");
    }

    #[tokio::test]
    async fn test_refuses_beyond_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1).await;

        let (server, _client) = duplex(1024);
        manager
            .admit(server, peer(), |_, _stream, token| async move {
                token.cancelled().await;
                Err(Error::Cancelled)
            })
            .await
            .unwrap();
        assert_eq!(manager.len(), 1);

        let (server, mut client) = duplex(1024);
        let err = manager
            .admit(server, peer(), |_, _stream, _token| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyClients));
        assert_eq!(manager.len(), 1);

        let mut greeting = String::new();
        client.read_to_string(&mut greeting).await.unwrap();
        assert_eq!(greeting, "* BYE too many clients\r\n");

        manager.shutdown().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_finished_sessions_unregister() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 2).await;

        let (server, _client) = duplex(64);
        manager
            .admit(server, peer(), |_, _stream, _token| async { Ok(()) })
            .await
            .unwrap();
        let (server, _client) = duplex(64);
        manager
            .admit(server, peer(), |_, _stream, _token| async {
                Err(Error::Protocol("client went away".to_string()))
            })
            .await
            .unwrap();

        wait_until_empty(&manager).await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_failing_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 3).await;

        for fail in [false, true, false] {
            let (server, _client) = duplex(64);
            manager
                .admit(server, peer(), move |_, _stream, token| async move {
                    token.cancelled().await;
                    if fail {
                        Err(Error::Internal("torn down badly".to_string()))
                    } else {
                        Err(Error::Cancelled)
                    }
                })
                .await
                .unwrap();
        }
        assert_eq!(manager.len(), 3);

        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
