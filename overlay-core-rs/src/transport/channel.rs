//! In-process transport over tokio channels
//!
//! Links nodes back to back without sockets. Used by the integration tests
//! and handy for embedding several nodes in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Transport, TransportError};
use crate::node::Node;
use crate::types::{ConnectionId, RawFrame};

/// One side's view of in-memory connections
#[derive(Default)]
pub struct ChannelTransport {
    links: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<RawFrame>>>,
    next_id: AtomicU64,
    tap: Mutex<Option<mpsc::UnboundedSender<(ConnectionId, RawFrame)>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        })
    }

    /// Copy of every frame this side sends
    pub fn tap(&self) -> mpsc::UnboundedReceiver<(ConnectionId, RawFrame)> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tap.lock() = Some(tx);
        rx
    }

    /// Drop the outbound half of a connection; the peer sees it close
    pub fn detach(&self, connection: ConnectionId) -> bool {
        self.links.write().remove(&connection).is_some()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.links.read().keys().copied().collect()
    }

    fn attach(&self, tx: mpsc::UnboundedSender<RawFrame>) -> ConnectionId {
        let connection = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.links.write().insert(connection, tx);
        connection
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, connection: ConnectionId, frame: RawFrame) -> Result<(), TransportError> {
        let tx = self
            .links
            .read()
            .get(&connection)
            .cloned()
            .ok_or(TransportError::UnknownConnection(connection))?;

        if let Some(tap) = self.tap.lock().as_ref() {
            let _ = tap.send((connection, frame.clone()));
        }
        tx.send(frame).map_err(|_| TransportError::Closed(connection))
    }
}

/// Connection between two linked nodes
pub struct Link {
    /// Connection id on the first node
    pub a: ConnectionId,
    /// Connection id on the second node
    pub b: ConnectionId,
    a_transport: Arc<ChannelTransport>,
    b_transport: Arc<ChannelTransport>,
}

impl Link {
    /// Close both directions; each node gets `connection_lost`
    pub fn close(&self) {
        self.a_transport.detach(self.a);
        self.b_transport.detach(self.b);
    }
}

/// Connect two nodes and register each as the other's neighbour
pub fn link(
    a: &Arc<Node>,
    a_transport: &Arc<ChannelTransport>,
    b: &Arc<Node>,
    b_transport: &Arc<ChannelTransport>,
) -> Link {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();

    let a_conn = a_transport.attach(to_b);
    let b_conn = b_transport.attach(to_a);

    a.routes().add(b.id().clone(), a_conn);
    b.routes().add(a.id().clone(), b_conn);

    spawn_pump(a.clone(), a_conn, from_b);
    spawn_pump(b.clone(), b_conn, from_a);

    debug!("Linked {} ({}) <-> {} ({})", a.id(), a_conn, b.id(), b_conn);
    Link {
        a: a_conn,
        b: b_conn,
        a_transport: a_transport.clone(),
        b_transport: b_transport.clone(),
    }
}

/// Peer driven by hand, for talking raw frames to a node
pub struct RawPeer {
    /// Connection id on the node's side
    pub connection: ConnectionId,
    tx: mpsc::UnboundedSender<RawFrame>,
    rx: mpsc::UnboundedReceiver<RawFrame>,
}

impl RawPeer {
    pub fn send(&self, frame: RawFrame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Closed(self.connection))
    }

    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(RawFrame::Text(text.to_string()))
    }

    /// Next frame the node sent, `None` once the node side is gone
    pub async fn recv(&mut self) -> Option<RawFrame> {
        self.rx.recv().await
    }
}

/// Attach a hand-driven peer to `node`
pub fn connect_raw(node: &Arc<Node>, transport: &Arc<ChannelTransport>) -> RawPeer {
    let (to_peer, from_node) = mpsc::unbounded_channel();
    let (to_node, from_peer) = mpsc::unbounded_channel();

    let connection = transport.attach(to_peer);
    spawn_pump(node.clone(), connection, from_peer);

    RawPeer {
        connection,
        tx: to_node,
        rx: from_node,
    }
}

fn spawn_pump(node: Arc<Node>, connection: ConnectionId, mut rx: mpsc::UnboundedReceiver<RawFrame>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            trace!("{} <- {} ({} bytes)", node.id(), connection, frame.len());
            let node = node.clone();
            tokio::spawn(async move {
                node.on_frame_received(connection, frame).await;
            });
        }
        node.connection_lost(connection);
    });
}
