//! Networking node
//!
//! Ties the engine together: codec, routing, signatures, correlation and
//! dispatch behind one [`Node`] that transports feed frames into.
//!
//! ## Architecture
//!
//! ```text
//!        Transport (WebSocket / channel)
//!            │ RawFrame          ▲ RawFrame
//!            ▼                   │
//! ┌──────────────────────────────────────────┐
//! │  Node                                    │
//! │  ┌───────┐   ┌───────────┐  ┌──────────┐ │
//! │  │ codec │──►│ dispatch  │─►│ registry │ │
//! │  └───────┘   │ / relay   │  └──────────┘ │
//! │              └─────┬─────┘               │
//! │   ┌─────────┐ ┌────┴──────┐ ┌──────────┐ │
//! │   │ routing │ │ pending   │ │ signature│ │
//! │   └─────────┘ └───────────┘ └──────────┘ │
//! └──────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::{self, Call, CallResult, Frame, RoutingHeader};
use crate::config::NodeConfig;
use crate::correlation::{PendingRequests, ResponseOutcome};
use crate::observer::{notify, Observer, RequestSent, TracingObserver};
use crate::outcome::{CallFailure, RemoteError};
use crate::registry::{HandlerRegistry, OcppRequest};
use crate::routing::{NetworkPath, RouteTable, RoutingError, SourceRouting};
use crate::signature::{SignaturePolicy, SigningError};
use crate::transport::Transport;
use crate::types::{ConnectionId, EventTrackingId, NodeId};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no transport configured")]
    MissingTransport,

    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// One participant in the overlay: station, relay or central system
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) config: NodeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) policy: Arc<dyn SignaturePolicy>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) pending: PendingRequests,
    pub(crate) routes: RouteTable,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Periodically time out overdue requests
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.pending.spawn_sweeper(self.config.sweep_interval)
    }

    /// The transport closed `connection`
    pub fn connection_lost(&self, connection: ConnectionId) {
        let failed = self.pending.fail_connection(connection);
        let lost = self.routes.remove_connection(connection);
        info!(
            "{}: {} closed ({} requests failed, routes lost: {:?})",
            self.id, connection, failed, lost
        );
    }

    /// Send a Call on `connection` and wait for its response
    pub async fn call(&self, connection: ConnectionId, mut call: Call) -> Result<CallResult, CallFailure> {
        self.policy.sign_request(&mut call)?;

        let timeout = call.timeout().unwrap_or(self.config.request_timeout);
        let message_id = call.message_id.clone();
        let action = call.action.clone();
        let handle = self.pending.register(connection, message_id.clone(), &action, timeout)?;

        debug!("{} -> {}: {} {}", self.id, connection, action, message_id);
        if let Err(e) = self.transport.send(connection, codec::encode(&Frame::Call(call))).await {
            let _ = handle.cancel().await;
            return Err(e.into());
        }

        let sent = RequestSent {
            connection,
            message_id,
            action,
        };
        notify("request_sent", self.observer.request_sent(&sent)).await;

        match handle.wait().await {
            ResponseOutcome::Resolved(result) => Ok(result),
            ResponseOutcome::Rejected(error) => Err(CallFailure::Remote(RemoteError::from(error))),
            ResponseOutcome::SignatureInvalid { result, reason } => Err(CallFailure::Signature {
                reason,
                payload: result.payload,
            }),
            ResponseOutcome::TimedOut => Err(CallFailure::Timeout),
            ResponseOutcome::ConnectionLost => Err(CallFailure::ConnectionLost),
        }
    }

    /// Send a Call along `route` (next hop first, destination last)
    pub async fn call_routed(
        &self,
        route: SourceRouting,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<CallResult, CallFailure> {
        let next_hop = route.next_hop().ok_or(RoutingError::EmptyRoute)?;
        let connection = self.routes.resolve(next_hop)?;

        let header = RoutingHeader {
            route,
            network_path: NetworkPath::from_origin(self.id.clone()),
            event_tracking_id: Some(EventTrackingId::new()),
            timeout_ms: Some(self.config.request_timeout.as_millis() as u64),
            timestamp: Some(Utc::now()),
        };
        let call = Call::new(action, payload)
            .with_header(header)
            .with_format(self.config.wire_format);

        self.call(connection, call).await
    }

    /// Typed request on a direct connection
    pub async fn request<R: OcppRequest>(
        &self,
        connection: ConnectionId,
        request: &R,
    ) -> Result<R::Response, CallFailure> {
        let payload = request.request_document().map_err(CallFailure::InvalidRequest)?;
        let call = Call::new(R::ACTION, payload).with_format(self.config.wire_format);
        let result = self.call(connection, call).await?;
        R::parse_response(&result.payload).map_err(CallFailure::InvalidResponse)
    }

    /// Typed request along `route`
    pub async fn request_routed<R: OcppRequest>(
        &self,
        route: SourceRouting,
        request: &R,
    ) -> Result<R::Response, CallFailure> {
        let payload = request.request_document().map_err(CallFailure::InvalidRequest)?;
        let result = self.call_routed(route, R::ACTION, payload).await?;
        R::parse_response(&result.payload).map_err(CallFailure::InvalidResponse)
    }
}

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: HandlerRegistry,
    policy: Option<Arc<dyn SignaturePolicy>>,
    observer: Option<Arc<dyn Observer>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            transport: None,
            registry: HandlerRegistry::new(),
            policy: None,
            observer: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override the policy derived from the configuration
    pub fn signature_policy(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Arc<Node>, BuildError> {
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        let policy = match self.policy {
            Some(policy) => policy,
            None => self.config.signature_policy()?,
        };

        info!(
            "Node {} ready ({} actions handled locally)",
            self.config.node_id,
            self.registry.actions().count()
        );

        Ok(Arc::new(Node {
            id: self.config.node_id(),
            config: self.config,
            transport,
            registry: self.registry,
            policy,
            observer: self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
            pending: PendingRequests::new(),
            routes: RouteTable::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[test]
    fn test_builder_requires_transport() {
        let result = Node::builder(NodeConfig::new("n")).build();
        assert!(matches!(result, Err(BuildError::MissingTransport)));
    }

    #[test]
    fn test_builder_rejects_bad_keys() {
        let result = Node::builder(NodeConfig::new("n").with_signing_seed("zz"))
            .transport(ChannelTransport::new())
            .build();
        assert!(matches!(result, Err(BuildError::Signing(_))));
    }

    #[tokio::test]
    async fn test_call_routed_needs_a_route() {
        let node = Node::builder(NodeConfig::new("Device"))
            .transport(ChannelTransport::new())
            .build()
            .unwrap();

        let err = node
            .call_routed(SourceRouting::local(), "Heartbeat", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::Routing(RoutingError::EmptyRoute)));

        let err = node
            .call_routed(SourceRouting::to(NodeId::from("CSMS")), "Heartbeat", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::Routing(RoutingError::Unroutable(_))));
    }

    #[tokio::test]
    async fn test_call_on_unknown_connection_cleans_up() {
        let node = Node::builder(NodeConfig::new("Device"))
            .transport(ChannelTransport::new())
            .build()
            .unwrap();

        let err = node
            .call(ConnectionId(99), Call::new("Heartbeat", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::Transport(_)));
        assert!(node.pending().is_empty());
    }
}
