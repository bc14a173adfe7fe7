//! Source routing across networking nodes
//!
//! A message records every hop it traversed in its [`NetworkPath`]. Replies
//! travel back along the exact reverse of that path, expressed as a
//! [`SourceRouting`] descriptor that each hop peels one entry off.
//!
//! ```text
//!  Device ──► Relay1 ──► Relay2          path at Relay2: [Device, Relay1]
//!  Device ◄── Relay1 ◄── Relay2          reply route:    [Relay1, Device]
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{ConnectionId, NodeId};

/// Routing failures reported by a node that cannot deliver a message
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unroutable destination: no connection towards {0}")]
    Unroutable(NodeId),

    #[error("routing loop: {0} already in network path")]
    Loop(NodeId),

    #[error("empty route")]
    EmptyRoute,
}

/// Ordered, append-only list of hops a message has traversed.
/// The first entry is the originator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Path of a message that starts at `origin`
    pub fn from_origin(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    pub fn from_hops(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The hop that handed the message to the current holder
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    /// Path to put on a message this node forwards
    pub fn extend(&self, self_id: &NodeId) -> NetworkPath {
        let mut hops = self.0.clone();
        hops.push(self_id.clone());
        NetworkPath(hops)
    }

    /// Like [`extend`](Self::extend) but refuses to visit a node twice
    pub fn try_extend(&self, self_id: &NodeId) -> Result<NetworkPath, RoutingError> {
        if self.contains(self_id) {
            return Err(RoutingError::Loop(self_id.clone()));
        }
        Ok(self.extend(self_id))
    }

    /// Return route for a reply: the exact reverse of this path
    pub fn reverse(&self) -> SourceRouting {
        SourceRouting(self.0.iter().rev().cloned().collect())
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

/// Destination chain of a message: the next hop first, the final
/// destination last. An empty descriptor means "deliver locally".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRouting(Vec<NodeId>);

impl SourceRouting {
    pub fn local() -> Self {
        Self(Vec::new())
    }

    /// Single-hop route to a directly connected node
    pub fn to(destination: NodeId) -> Self {
        Self(vec![destination])
    }

    /// Route through `relays` (in order) to `destination`
    pub fn via(relays: impl IntoIterator<Item = NodeId>, destination: NodeId) -> Self {
        let mut hops: Vec<NodeId> = relays.into_iter().collect();
        hops.push(destination);
        Self(hops)
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.is_empty()
    }

    pub fn next_hop(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn final_destination(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Remaining route after the next hop has been reached
    pub fn advance(&self) -> SourceRouting {
        SourceRouting(self.0.iter().skip(1).cloned().collect())
    }

    /// Drop the head of the route if it names the receiving node
    pub fn arrived_at(&self, self_id: &NodeId) -> SourceRouting {
        match self.next_hop() {
            Some(head) if head == self_id => self.advance(),
            _ => self.clone(),
        }
    }
}

impl From<Vec<NodeId>> for SourceRouting {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

/// Neighbour table: which connection leads to which adjacent node
#[derive(Debug, Default)]
pub struct RouteTable {
    neighbours: RwLock<HashMap<NodeId, ConnectionId>>,
    default_route: RwLock<Option<ConnectionId>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directly connected neighbour
    pub fn add(&self, node: NodeId, connection: ConnectionId) {
        info!("Route {} via {}", node, connection);
        self.neighbours.write().insert(node, connection);
    }

    /// Record the neighbour a message arrived from; true if the table changed
    pub fn learn(&self, node: &NodeId, connection: ConnectionId) -> bool {
        let known = self.neighbours.read().get(node) == Some(&connection);
        if !known {
            self.add(node.clone(), connection);
        }
        !known
    }

    /// Use `connection` for destinations with no direct neighbour entry
    pub fn set_default(&self, connection: Option<ConnectionId>) {
        *self.default_route.write() = connection;
    }

    /// Forget every route over a closed connection; returns the nodes lost
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<NodeId> {
        let mut neighbours = self.neighbours.write();
        let lost: Vec<NodeId> = neighbours
            .iter()
            .filter(|(_, c)| **c == connection)
            .map(|(n, _)| n.clone())
            .collect();
        for node in &lost {
            neighbours.remove(node);
        }
        drop(neighbours);

        let mut default_route = self.default_route.write();
        if *default_route == Some(connection) {
            *default_route = None;
        }

        if !lost.is_empty() {
            debug!("Dropped routes {:?} ({} closed)", lost, connection);
        }
        lost
    }

    /// Connection towards `next_hop`
    pub fn resolve(&self, next_hop: &NodeId) -> Result<ConnectionId, RoutingError> {
        if let Some(conn) = self.neighbours.read().get(next_hop) {
            return Ok(*conn);
        }
        (*self.default_route.read()).ok_or_else(|| RoutingError::Unroutable(next_hop.clone()))
    }

    /// Neighbour reachable over `connection`, if one is registered
    pub fn neighbour_on(&self, connection: ConnectionId) -> Option<NodeId> {
        self.neighbours
            .read()
            .iter()
            .find(|(_, c)| **c == connection)
            .map(|(n, _)| n.clone())
    }
}
