//! Active-connection registry.
//!
//! Maps session ids to close handles. Touched only when a session is created,
//! when it closes, and when the server enumerates sessions at shutdown. No
//! session state flows through it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// Registry entry for one open session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Signals the session task to close itself.
    pub close_tx: mpsc::Sender<()>,
    pub remote_addr: SocketAddr,
    pub opened_at: Instant,
}

/// Summary returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub age_secs: u64,
}

/// Registry of open sessions, shared between the server and its sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    /// Monotonic session id counter.
    next_id: AtomicU64,
    emptied: Notify,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            emptied: Notify::new(),
        }
    }

    /// Allocate the next session id. Ids start at 1 and never repeat.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, id: u64, handle: SessionHandle) {
        self.sessions.lock().await.insert(id, handle);
        debug!(session_id = id, "session registered");
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub async fn remove(&self, id: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(&id).is_some();
        if removed {
            debug!(session_id = id, remaining = sessions.len(), "session unregistered");
        }
        if sessions.is_empty() {
            self.emptied.notify_waiters();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// List open sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, h)| SessionInfo {
                id: *id,
                remote_addr: h.remote_addr,
                age_secs: h.opened_at.elapsed().as_secs(),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Ask every registered session to close. Returns how many were signalled.
    ///
    /// Sessions remove themselves once closed; use [`wait_until_empty`] to
    /// wait for that.
    ///
    /// [`wait_until_empty`]: SessionRegistry::wait_until_empty
    pub async fn close_all(&self) -> usize {
        let senders: Vec<mpsc::Sender<()>> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|h| h.close_tx.clone())
            .collect();
        for tx in &senders {
            // A full channel already carries a close request.
            let _ = tx.try_send(());
        }
        senders.len()
    }

    /// Wait until no sessions remain, up to `timeout`. Returns `true` if the
    /// registry emptied in time.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.emptied.notified();
                if self.is_empty().await {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (SessionHandle, mpsc::Receiver<()>) {
        let (close_tx, close_rx) = mpsc::channel(1);
        let handle = SessionHandle {
            close_tx,
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
            opened_at: Instant::now(),
        };
        (handle, close_rx)
    }

    #[test]
    fn ids_are_monotonic() {
        let registry = SessionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        let c = registry.next_id();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn insert_and_remove_track_size() {
        let registry = SessionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        registry.insert(1, h1).await;
        registry.insert(2, h2).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.list().await.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);

        assert!(registry.remove(1).await);
        assert!(!registry.remove(1).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn close_all_signals_every_session() {
        let registry = SessionRegistry::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        registry.insert(1, h1).await;
        registry.insert(2, h2).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());

        // Repeated requests do not block on a full channel.
        assert_eq!(registry.close_all().await, 2);
    }

    #[tokio::test]
    async fn wait_until_empty_wakes_on_last_removal() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        let (h, _rx) = handle();
        registry.insert(7, h).await;

        let r = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            r.remove(7).await;
        });

        assert!(registry.wait_until_empty(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn wait_until_empty_times_out() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle();
        registry.insert(1, h).await;
        assert!(!registry.wait_until_empty(Duration::from_millis(50)).await);
    }
}
