use crate::config::DuplicateIdentityPolicy;
use crate::error::RelayError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// Serialized envelope text, shared by every recipient of one broadcast.
pub type Outbound = Arc<String>;

/// Registry entry used to queue messages for one connection.
///
/// The socket itself stays with the connection task; the registry only ever
/// sees the sending half of that task's bounded outbound queue.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    /// Identity the connection registered under.
    pub identity: String,
    /// Per-relay unique id, distinguishes reconnects under the same identity.
    pub conn_id: u64,
    /// Instant the connection was registered.
    pub connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    close: Arc<Notify>,
    drops: Arc<AtomicU64>,
}

impl ClientHandle {
    /// Create a handle around the sending half of a connection's queue.
    #[must_use]
    pub fn new(identity: impl Into<String>, conn_id: u64, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            identity: identity.into(),
            conn_id,
            connected_at: Instant::now(),
            tx,
            close: Arc::new(Notify::new()),
            drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `true` while the connection task still drains its queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns the queue's error when it is full or its receiver is gone.
    pub fn try_send(&self, msg: Outbound) -> Result<(), mpsc::error::TrySendError<Outbound>> {
        self.tx.try_send(msg)
    }

    /// Ask the owning connection task to close its socket.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`ClientHandle::request_close`] has been called.
    pub async fn close_requested(&self) {
        self.close.notified().await;
    }

    /// Count one message dropped for this client; returns the new total.
    pub fn record_drop(&self) -> u64 {
        self.drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Messages dropped for this client so far.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Concurrent identity → connection table.
#[derive(Debug, Default)]
pub struct Registry {
    clients: DashMap<String, ClientHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle under its identity.
    ///
    /// With [`DuplicateIdentityPolicy::Replace`] the previous holder (if any) is
    /// returned so the caller can close it. With
    /// [`DuplicateIdentityPolicy::Reject`] an open previous holder wins and the
    /// newcomer is refused; a stale one is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DuplicateIdentity`] when rejecting.
    pub fn register(
        &self,
        handle: ClientHandle,
        policy: DuplicateIdentityPolicy,
    ) -> Result<Option<ClientHandle>, RelayError> {
        match self.clients.entry(handle.identity.clone()) {
            Entry::Occupied(mut entry) => {
                if policy == DuplicateIdentityPolicy::Reject && entry.get().is_open() {
                    return Err(RelayError::DuplicateIdentity(handle.identity));
                }
                Ok(Some(entry.insert(handle)))
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(None)
            }
        }
    }

    /// Remove whatever is registered under `identity`. Absent is not an error.
    pub fn unregister(&self, identity: &str) -> Option<ClientHandle> {
        self.clients.remove(identity).map(|(_, handle)| handle)
    }

    /// Remove the entry only if it still belongs to connection `conn_id`.
    pub fn unregister_if(&self, identity: &str, conn_id: u64) -> bool {
        self.clients
            .remove_if(identity, |_, v| v.conn_id == conn_id)
            .is_some()
    }

    /// Look up a connection handle by identity.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<ClientHandle> {
        self.clients.get(identity).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every entry, for iteration without holding shard locks.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove every entry, returning them.
    pub fn drain(&self) -> Vec<ClientHandle> {
        let identities: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        identities
            .iter()
            .filter_map(|identity| self.unregister(identity))
            .collect()
    }

    /// Number of tracked entries. May briefly include connections whose close
    /// has not been observed yet.
    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
