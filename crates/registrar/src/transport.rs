//! Push transport towards connected clients.
//!
//! [`ConnectionHub`] serves each connection as a server-sent-events stream:
//! a `hello` event carrying the address the server knows the client by,
//! then `changes` batches and `servers` membership updates. Dropping the
//! stream reports the connection as closed.

use axum::response::sse::Event;
use futures::StreamExt;
use futures::stream::BoxStream;
use rollcall_common::{ChangeEvent, RollcallError, RollcallResult};
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

/// Result of a push that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The recipient has no open connection here
    NotConnected,
}

/// Delivery seam between the dispatcher/leader timer and the wire
pub trait Transport: Send + Sync + 'static {
    /// Send one batch of events to a connected client
    fn push(
        &self,
        recipient: &str,
        events: &[ChangeEvent],
    ) -> impl Future<Output = RollcallResult<PushOutcome>> + Send;

    /// Drop every open connection
    fn disconnect_all(&self) -> impl Future<Output = ()> + Send;

    /// Announce the live server set and restrict inbound peers to it
    fn update_membership(&self, servers: &BTreeSet<String>) -> impl Future<Output = ()> + Send;
}

/// Lifecycle notification emitted by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { address: String },
    Closed { address: String, connection_id: u64 },
}

struct Connection {
    id: u64,
    sender: mpsc::Sender<Event>,
}

/// Server-sent-events connection registry
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Connection>>,
    allowed_peers: RwLock<BTreeSet<IpAddr>>,
    next_id: AtomicU64,
    buffer: usize,
    lifecycle: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Fires `Closed` when the stream is dropped
struct ConnectionGuard {
    address: String,
    connection_id: u64,
    lifecycle: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.lifecycle.send(ConnectionEvent::Closed {
            address: std::mem::take(&mut self.address),
            connection_id: self.connection_id,
        });
    }
}

impl ConnectionHub {
    /// Create a hub with a per-connection queue of `buffer` events
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (lifecycle, events) = mpsc::unbounded_channel();
        let hub = Self {
            connections: RwLock::new(HashMap::new()),
            allowed_peers: RwLock::new(BTreeSet::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            lifecycle,
        };
        (hub, events)
    }

    /// Register a connection and return its event stream
    pub async fn attach(&self, address: String) -> BoxStream<'static, Result<Event, Infallible>> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let hello = Event::default().event("hello").data(address.clone());
        let _ = sender.try_send(hello);

        let replaced = self
            .connections
            .write()
            .await
            .insert(address.clone(), Connection { id: connection_id, sender });
        if replaced.is_some() {
            tracing::warn!(client = %address, "Connection replaced an open one for the same address");
        }
        tracing::debug!(client = %address, connection_id, "Connection attached");
        let _ = self.lifecycle.send(ConnectionEvent::Opened {
            address: address.clone(),
        });

        let guard = ConnectionGuard {
            address,
            connection_id,
            lifecycle: self.lifecycle.clone(),
        };
        futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            let event = receiver.recv().await?;
            Some((Ok(event), (receiver, guard)))
        })
        .boxed()
    }

    /// Forget a connection unless a newer one took its address
    pub async fn detach(&self, address: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(address) {
            Some(connection) if connection.id == connection_id => {
                connections.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Whether a server peer at `ip` is part of the current membership
    pub async fn is_allowed_peer(&self, ip: IpAddr) -> bool {
        self.allowed_peers.read().await.contains(&ip)
    }

    pub async fn connected(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Transport for ConnectionHub {
    async fn push(&self, recipient: &str, events: &[ChangeEvent]) -> RollcallResult<PushOutcome> {
        let sender = {
            let connections = self.connections.read().await;
            match connections.get(recipient) {
                Some(connection) => connection.sender.clone(),
                None => return Ok(PushOutcome::NotConnected),
            }
        };

        let data = serde_json::to_string(events).map_err(|e| RollcallError::Delivery {
            recipient: recipient.to_string(),
            reason: e.to_string(),
        })?;
        let mut event = Event::default().event("changes").data(data);
        if let Some(last) = events.last() {
            event = event.id(last.sequence.to_string());
        }

        match sender.send(event).await {
            Ok(()) => Ok(PushOutcome::Delivered),
            Err(_) => Ok(PushOutcome::NotConnected),
        }
    }

    async fn disconnect_all(&self) {
        let dropped = {
            let mut connections = self.connections.write().await;
            let count = connections.len();
            connections.clear();
            count
        };
        tracing::warn!(connections = dropped, "Dropped every client connection");
    }

    async fn update_membership(&self, servers: &BTreeSet<String>) {
        let peers: BTreeSet<IpAddr> = servers
            .iter()
            .filter_map(|server| match server.parse::<SocketAddr>() {
                Ok(addr) => Some(addr.ip()),
                Err(_) => {
                    tracing::warn!(server = %server, "Server address is not a socket address");
                    None
                }
            })
            .collect();
        *self.allowed_peers.write().await = peers;

        let data = match serde_json::to_string(servers) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server list");
                return;
            }
        };
        let connections = self.connections.read().await;
        for (address, connection) in connections.iter() {
            let event = Event::default().event("servers").data(data.clone());
            if connection.sender.try_send(event).is_err() {
                tracing::debug!(client = %address, "Membership update skipped, queue full");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_common::{ChangeKind, ChangeSubject, ResourceKey};

    fn event(sequence: u64) -> ChangeEvent {
        ChangeEvent {
            subscriber: "10.0.0.9:5000".to_string(),
            server_address: "10.0.0.1:7070".to_string(),
            sequence,
            kind: ChangeKind::Created,
            subject: ChangeSubject::resource(ResourceKey::new("svc", "a")),
        }
    }

    #[tokio::test]
    async fn test_push_requires_open_connection() {
        let (hub, _events) = ConnectionHub::new(8);
        let outcome = hub.push("10.0.0.9:5000", &[event(1)]).await.unwrap();
        assert_eq!(outcome, PushOutcome::NotConnected);
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let (hub, mut lifecycle) = ConnectionHub::new(8);
        let mut stream = hub.attach("10.0.0.9:5000".to_string()).await;

        assert_eq!(
            lifecycle.recv().await,
            Some(ConnectionEvent::Opened {
                address: "10.0.0.9:5000".to_string()
            })
        );
        assert!(stream.next().await.is_some()); // hello

        let outcome = hub.push("10.0.0.9:5000", &[event(1), event(2)]).await.unwrap();
        assert_eq!(outcome, PushOutcome::Delivered);
        assert!(stream.next().await.is_some());

        drop(stream);
        let Some(ConnectionEvent::Closed { address, connection_id }) = lifecycle.recv().await else {
            panic!("expected a close event");
        };
        assert!(hub.detach(&address, connection_id).await);
        assert_eq!(hub.connected().await, 0);
    }

    #[tokio::test]
    async fn test_membership_sets_peer_allow_list() {
        let (hub, _events) = ConnectionHub::new(8);
        let servers = BTreeSet::from(["10.0.0.1:7070".to_string(), "bogus".to_string()]);

        hub.update_membership(&servers).await;

        assert!(hub.is_allowed_peer("10.0.0.1".parse().unwrap()).await);
        assert!(!hub.is_allowed_peer("10.0.0.2".parse().unwrap()).await);
    }
}
