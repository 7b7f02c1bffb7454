//! Lazily-populated cache of connected clients, keyed by server id.
//!
//! Discovery and the executor each own a private pool, so the same server may
//! hold two independent connections when both use it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::client::McpClient;
use super::errors::McpError;
use super::registry::ServerRegistry;
use super::transport::TransportOptions;

/// One server's cached client. Connecting holds only this slot's lock, so
/// a slow handshake never stalls callers of other servers.
type Slot = Arc<Mutex<Option<Arc<McpClient>>>>;

/// Per-component client cache that reconnects on demand.
pub struct ClientPool {
    registry: Arc<ServerRegistry>,
    options: TransportOptions,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ClientPool {
    pub fn new(registry: Arc<ServerRegistry>, options: TransportOptions) -> Self {
        Self {
            registry,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    async fn slot(&self, server_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(server_id.to_string()).or_default())
    }

    /// Return the cached client, or connect a fresh one when there is none
    /// or the cached one reports itself disconnected.
    ///
    /// Concurrent callers for the same server share a single connect.
    pub async fn get_or_connect(&self, server_id: &str) -> Result<Arc<McpClient>, McpError> {
        self.checkout(server_id).await.map(|(client, _)| client)
    }

    /// Like [`get_or_connect`](Self::get_or_connect), also reporting whether
    /// the client was connected by this call.
    pub async fn checkout(&self, server_id: &str) -> Result<(Arc<McpClient>, bool), McpError> {
        let slot = self.slot(server_id).await;
        let mut cached = slot.lock().await;

        if let Some(client) = cached.as_ref() {
            if client.is_connected() {
                return Ok((Arc::clone(client), false));
            }
            tracing::info!(server = server_id, "cached client disconnected, reconnecting");
            *cached = None;
        }

        let mut client = McpClient::new(server_id, Arc::clone(&self.registry), self.options);
        client.connect().await?;
        let client = Arc::new(client);
        *cached = Some(Arc::clone(&client));
        Ok((client, true))
    }

    /// Drop a cached client; its process is stopped once the last handle goes.
    pub async fn evict(&self, server_id: &str) -> bool {
        let removed = self.slots.lock().await.remove(server_id);
        match removed {
            Some(slot) => slot.lock().await.take().is_some(),
            None => false,
        }
    }

    /// Disconnect every cached client.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Slot)> = self.slots.lock().await.drain().collect();
        for (server_id, slot) in drained {
            let Some(client) = slot.lock().await.take() else {
                continue;
            };
            match Arc::try_unwrap(client) {
                Ok(mut client) => client.disconnect().await,
                Err(_) => {
                    // Still borrowed by an in-flight call; the process is
                    // killed when that call releases its handle.
                    tracing::debug!(server = %server_id, "client in use, deferring shutdown");
                }
            }
        }
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
