//! WebSocket transport
//!
//! Handles:
//! - Accepting downstream peers, identified by the last URL path segment
//! - OCPP subprotocol negotiation
//! - The upstream connection with exponential backoff reconnects
//! - Text frames for JSON, binary frames for the compact encoding

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        protocol::WebSocketConfig as ProtocolConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::{Transport, TransportError};
use crate::config::WebSocketConfig;
use crate::node::Node;
use crate::types::{ConnectionId, NodeId, RawFrame};

/// Outbound queue depth per connection
const SEND_QUEUE: usize = 64;

/// Live WebSocket connections of one node
pub struct WsTransport {
    config: WebSocketConfig,
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Message>>>,
    next_id: AtomicU64,
}

impl WsTransport {
    pub fn new(config: WebSocketConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..Default::default()
        }
    }

    /// First configured subprotocol the peer offered
    fn negotiate(&self, offered: &str) -> Option<String> {
        let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
        self.config
            .subprotocols
            .iter()
            .find(|p| offered.contains(&p.as_str()))
            .cloned()
    }

    /// Register a socket and pump it until it closes. An upstream socket
    /// also serves as the default route.
    async fn run_connection<S>(self: &Arc<Self>, node: Arc<Node>, peer: Option<NodeId>, upstream: bool, stream: S)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + 'static,
    {
        let connection = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(SEND_QUEUE);
        self.connections.write().insert(connection, send_tx);

        if let Some(peer) = &peer {
            node.routes().add(peer.clone(), connection);
        }
        if upstream {
            node.routes().set_default(Some(connection));
        }
        info!("{} connected as {} ({:?})", node.id(), connection, peer);

        let sender_handle = tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    error!("Failed to send WebSocket message on {}: {}", connection, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(msg) = ws_rx.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => RawFrame::Text(text),
                Ok(Message::Binary(data)) => RawFrame::Binary(data),
                Ok(Message::Close(_)) => {
                    info!("WebSocket {} closed by peer", connection);
                    break;
                }
                // Pings are answered by tungstenite
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error on {}: {}", connection, e);
                    break;
                }
            };

            debug!("{} <- {} ({} bytes)", node.id(), connection, frame.len());
            let node = node.clone();
            tokio::spawn(async move {
                node.on_frame_received(connection, frame).await;
            });
        }

        self.connections.write().remove(&connection);
        sender_handle.abort();
        node.connection_lost(connection);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, connection: ConnectionId, frame: RawFrame) -> Result<(), TransportError> {
        let tx = self
            .connections
            .read()
            .get(&connection)
            .cloned()
            .ok_or(TransportError::UnknownConnection(connection))?;

        let msg = match frame {
            RawFrame::Text(text) => Message::Text(text),
            RawFrame::Binary(data) => Message::Binary(data),
        };
        tx.send(msg).await.map_err(|_| TransportError::Closed(connection))
    }
}

/// Accept downstream peers on `listener` until the task is dropped
pub async fn serve(node: Arc<Node>, transport: Arc<WsTransport>, listener: TcpListener) -> Result<(), TransportError> {
    info!("{} listening on {}", node.id(), listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        let transport = transport.clone();

        tokio::spawn(async move {
            let mut path = String::new();
            let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();

                let offered = request
                    .headers()
                    .get(header::SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                match transport.negotiate(offered) {
                    Some(protocol) => {
                        if let Ok(value) = HeaderValue::from_str(&protocol) {
                            response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                        }
                    }
                    None => warn!("{} offered no supported subprotocol: {:?}", addr, offered),
                }
                Ok(response)
            };

            let ws_stream = match accept_hdr_async_with_config(stream, callback, Some(transport.protocol_config())).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake with {} failed: {}", addr, e);
                    return;
                }
            };

            let peer = peer_from_path(&path);
            transport.run_connection(node, peer, false, ws_stream).await;
        });
    }
}

/// Keep a connection to the configured upstream, reconnecting with backoff.
/// The upstream becomes the default route while connected.
pub async fn run_upstream(node: Arc<Node>, transport: Arc<WsTransport>) -> Result<(), TransportError> {
    let base_url = transport
        .config
        .upstream_url
        .clone()
        .ok_or_else(|| TransportError::InvalidUrl("no upstream configured".into()))?;
    let upstream_id = transport.config.upstream_id.clone().map(NodeId::new);
    let url = build_ocpp_url(&base_url, node.id().as_str());

    let mut reconnect_delay = transport.config.reconnect_delay;
    loop {
        info!("Connecting upstream: {}", url);

        match connect_upstream(&transport, &url).await {
            Ok(ws_stream) => {
                reconnect_delay = transport.config.reconnect_delay;
                transport
                    .run_connection(node.clone(), upstream_id.clone(), true, ws_stream)
                    .await;
                info!("Upstream connection closed");
            }
            Err(e) => error!("Upstream connection error: {}", e),
        }

        // Exponential backoff
        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, transport.config.max_reconnect_delay);
    }
}

async fn connect_upstream(
    transport: &WsTransport,
    url: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    TransportError,
> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let protocols = transport.config.subprotocols.join(", ");
    let value = HeaderValue::from_str(&protocols).map_err(|e| TransportError::WebSocket(e.to_string()))?;
    request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);

    let (ws_stream, response) = connect_async_with_config(request, Some(transport.protocol_config()), false)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    match accepted {
        Some(protocol) => info!("Upstream connected ({})", protocol),
        None => warn!("Upstream accepted no OCPP subprotocol"),
    }
    Ok(ws_stream)
}

/// Peer identity from the handshake path (`/ocpp/<node-id>`)
fn peer_from_path(path: &str) -> Option<NodeId> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(NodeId::from)
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:9000/ocpp", "Relay1");
        assert_eq!(url, "ws://localhost:9000/ocpp/Relay1");

        let url = build_ocpp_url("ws://localhost:9000/ocpp/", "Relay1");
        assert_eq!(url, "ws://localhost:9000/ocpp/Relay1");
    }

    #[test]
    fn test_peer_from_path() {
        assert_eq!(peer_from_path("/ocpp/Device-7"), Some(NodeId::from("Device-7")));
        assert_eq!(peer_from_path("/ocpp/Device-7/"), Some(NodeId::from("Device-7")));
        assert_eq!(peer_from_path("/"), None);
    }

    #[test]
    fn test_negotiate_prefers_configured_order() {
        let transport = WsTransport::new(WebSocketConfig::default());
        assert_eq!(transport.negotiate("ocpp2.0.1, ocpp2.1").as_deref(), Some("ocpp2.1"));
        assert_eq!(transport.negotiate("ocpp2.0.1").as_deref(), Some("ocpp2.0.1"));
        assert_eq!(transport.negotiate("ocpp1.6"), None);
    }
}
