//! Inbound frame handling
//!
//! Calls addressed to this node go through the dispatch pipeline:
//!
//! 1. resolve the action's handlers (none: `Failed`)
//! 2. parse the payload (failure: `FormationViolation`)
//! 3. verify signatures (failure: `SignatureError`)
//! 4. notify "request received"
//! 5. run handlers (first `Some` wins; error or panic: `ExceptionOccurred`)
//! 6. sign the response
//! 7. route it back along the reversed network path
//! 8. send, then notify "response sent"
//!
//! Calls whose route names a further hop are relayed: the node forwards the
//! Call, waits for the upstream answer and turns it into exactly one
//! response for the downstream caller.
//!
//! CallResults and CallErrors complete the matching pending request.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Call, CallError, CallResult, DecodeError, Frame, RoutingHeader};
use crate::correlation::ResponseOutcome;
use crate::node::Node;
use crate::observer::{notify, ErrorReceived, RequestReceived, RequestSent, ResponseReceived, ResponseSent};
use crate::outcome::{Outcome, RemoteError, Response, ResultCode};
use crate::registry::RequestContext;
use crate::routing::{NetworkPath, SourceRouting};
use crate::signature::SignatureState;
use crate::types::{ConnectionId, EventTrackingId, RawFrame, WireFormat};

impl Node {
    /// Entry point for transports: one raw frame from `connection`
    pub async fn on_frame_received(&self, connection: ConnectionId, raw: RawFrame) {
        let format = raw.format();
        match codec::decode(&raw) {
            Ok(Frame::Call(call)) => {
                self.handle_call(connection, call).await;
            }
            Ok(Frame::CallResult(result)) => self.handle_result(connection, result).await,
            Ok(Frame::CallError(error)) => self.handle_error(connection, error).await,
            Err(e) => self.handle_decode_error(connection, e, format).await,
        }
    }

    /// Answer one inbound Call; returns the category of the response sent
    pub(crate) async fn handle_call(&self, connection: ConnectionId, call: Call) -> ResultCode {
        debug!("{} <- {}: {} {}", self.id, connection, call.action, call.message_id);

        if let Some(last_hop) = call.network_path().last_hop() {
            self.routes.learn(last_hop, connection);
        }

        let remaining = call.route().arrived_at(&self.id);
        if remaining.is_local() {
            let outcome = self.dispatch_local(connection, &call).await;
            self.respond(connection, &call, outcome, false).await
        } else {
            let outcome = self.relay(&call, remaining).await;
            self.respond(connection, &call, outcome, true).await
        }
    }

    /// Steps 1 to 5
    async fn dispatch_local(&self, connection: ConnectionId, call: &Call) -> Outcome {
        let parsed = match self.registry.parse(&call.action, &call.payload) {
            None => {
                warn!("No handler for {} ({})", call.action, call.message_id);
                return Outcome::no_handler(&call.action);
            }
            Some(Err(diagnostic)) => {
                warn!("Malformed {} payload: {}", call.action, diagnostic);
                return Outcome::formation_violation(diagnostic);
            }
            Some(Ok(parsed)) => parsed,
        };

        let signature = self.policy.verify_request(call);
        if let SignatureState::VerificationFailed(failure) = &signature {
            warn!("Rejecting {} {}: {}", call.action, call.message_id, failure);
            return Outcome::signature_error(failure);
        }

        let received = RequestReceived {
            connection,
            message_id: call.message_id.clone(),
            action: call.action.clone(),
            network_path: call.network_path(),
            event_tracking_id: call.event_tracking_id().cloned(),
            signature: signature.clone(),
        };
        notify("request_received", self.observer.request_received(&received)).await;

        let ctx = RequestContext {
            connection,
            message_id: call.message_id.clone(),
            action: call.action.clone(),
            network_path: received.network_path,
            event_tracking_id: received.event_tracking_id,
            signature,
        };
        self.registry.invoke(ctx, parsed).await
    }

    /// Forward `call` to the next hop of `remaining` and wait for the answer
    async fn relay(&self, call: &Call, remaining: SourceRouting) -> Outcome {
        let Some(next_hop) = remaining.next_hop().cloned() else {
            return Outcome::failed("empty route");
        };

        let path = match call.network_path().try_extend(&self.id) {
            Ok(path) => path,
            Err(e) => {
                warn!("Not relaying {}: {}", call.message_id, e);
                return Outcome::failed(e.to_string());
            }
        };
        let upstream = match self.routes.resolve(&next_hop) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Not relaying {}: {}", call.message_id, e);
                return Outcome::failed(e.to_string());
            }
        };

        let mut forwarded = call.clone();
        let header = forwarded.header.get_or_insert_with(RoutingHeader::default);
        header.route = remaining;
        header.network_path = path;
        if header.event_tracking_id.is_none() {
            header.event_tracking_id = Some(EventTrackingId::new());
        }

        let timeout = call
            .timeout()
            .map_or(self.config.request_timeout, |t| t.min(self.config.request_timeout));
        let handle = match self
            .pending
            .register(upstream, forwarded.message_id.clone(), &forwarded.action, timeout)
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Not relaying {}: {}", call.message_id, e);
                return Outcome::failed(e.to_string());
            }
        };

        if let Err(e) = self.transport.send(upstream, codec::encode(&Frame::Call(forwarded))).await {
            error!("Relaying {} to {} failed: {}", call.message_id, next_hop, e);
            let _ = handle.cancel().await;
            return Outcome::failed(e.to_string());
        }
        info!("Relayed {} {} to {}", call.action, call.message_id, next_hop);

        let sent = RequestSent {
            connection: upstream,
            message_id: call.message_id.clone(),
            action: call.action.clone(),
        };
        notify("request_sent", self.observer.request_sent(&sent)).await;

        match handle.wait().await {
            ResponseOutcome::Resolved(result) => Outcome::relayed(result),
            ResponseOutcome::Rejected(error) => Outcome::request_error(RemoteError::from(error)),
            ResponseOutcome::SignatureInvalid { reason, .. } => Outcome::signature_error(&reason),
            ResponseOutcome::TimedOut => {
                Outcome::failed(format!("no response from {} within {:?}", next_hop, timeout))
            }
            ResponseOutcome::ConnectionLost => Outcome::failed(format!("connection to {} lost", next_hop)),
        }
    }

    /// Steps 6 to 8
    async fn respond(&self, connection: ConnectionId, call: &Call, outcome: Outcome, relayed: bool) -> ResultCode {
        let category = outcome.category();
        let header = call.header.as_ref().map(|h| self.response_header(h));

        let frame = match outcome.into_response(call.message_id.clone()) {
            Response::Result(mut result) => {
                // Relayed payloads keep the originator's signatures untouched
                if !relayed {
                    if let Err(e) = self.policy.sign_response(&call.action, &mut result) {
                        error!("Sending {} response unsigned: {}", call.action, e);
                    }
                }
                result.header = header;
                result.format = call.format;
                Frame::CallResult(result)
            }
            Response::Error(mut error) => {
                error.header = header;
                error.format = call.format;
                Frame::CallError(error)
            }
        };

        let send_result = self
            .transport
            .send(connection, codec::encode(&frame))
            .await
            .map_err(|e| e.to_string());
        if let Err(e) = &send_result {
            error!("Response to {} {} not sent: {}", call.action, call.message_id, e);
        }

        let sent = ResponseSent {
            connection,
            message_id: call.message_id.clone(),
            action: call.action.clone(),
            result: category,
            send_result,
        };
        notify("response_sent", self.observer.response_sent(&sent)).await;
        category
    }

    /// Routing header of a response to a Call carrying `request`
    pub(crate) fn response_header(&self, request: &RoutingHeader) -> RoutingHeader {
        RoutingHeader {
            route: request.network_path.reverse(),
            network_path: NetworkPath::from_origin(self.id.clone()),
            event_tracking_id: request.event_tracking_id.clone(),
            timeout_ms: None,
            timestamp: Some(Utc::now()),
        }
    }

    async fn handle_result(&self, connection: ConnectionId, result: CallResult) {
        let Some(completion) = self.pending.take(connection, &result.message_id) else {
            return;
        };

        let signature = self.policy.verify_response(completion.action(), &result);
        let received = ResponseReceived {
            connection,
            message_id: result.message_id.clone(),
            action: completion.action().to_string(),
            signature: signature.clone(),
        };
        notify("response_received", self.observer.response_received(&received)).await;

        let outcome = match signature {
            SignatureState::VerificationFailed(reason) => {
                warn!("Response {} to {} failed verification: {}", result.message_id, received.action, reason);
                ResponseOutcome::SignatureInvalid { result, reason }
            }
            _ => ResponseOutcome::Resolved(result),
        };
        if !completion.complete(outcome) {
            debug!("Caller stopped waiting for {}", received.message_id);
        }
    }

    async fn handle_error(&self, connection: ConnectionId, error: CallError) {
        let Some(completion) = self.pending.take(connection, &error.message_id) else {
            return;
        };

        let received = ErrorReceived {
            connection,
            message_id: error.message_id.clone(),
            action: completion.action().to_string(),
            error: RemoteError::from(&error),
        };
        notify("error_received", self.observer.error_received(&received)).await;

        if !completion.complete(ResponseOutcome::Rejected(error)) {
            debug!("Caller stopped waiting for {}", received.message_id);
        }
    }

    /// Broken frames are answered only when they are recognisably a Call
    async fn handle_decode_error(&self, connection: ConnectionId, e: DecodeError, format: WireFormat) {
        warn!("Undecodable frame on {}: {}", connection, e);
        let Some(message_id) = e.answerable_call_id().cloned() else {
            return;
        };

        let Response::Error(mut error) = Outcome::formation_violation(e.reason.to_string()).into_response(message_id)
        else {
            return;
        };
        error.format = format;

        if let Err(send_error) = self.transport.send(connection, codec::encode(&Frame::CallError(error))).await {
            error!("Could not reject undecodable frame on {}: {}", connection, send_error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::outcome::RESULT_CODE_KEY;
    use crate::transport::{connect_raw, ChannelTransport};
    use crate::types::NodeId;
    use serde_json::{json, Value};

    fn node(id: &str) -> (std::sync::Arc<Node>, std::sync::Arc<ChannelTransport>) {
        let transport = ChannelTransport::new();
        let mut registry = crate::registry::HandlerRegistry::new();
        registry.register_raw("Echo", |_, doc| async move { Ok(Some(doc)) });
        let node = Node::builder(NodeConfig::new(id))
            .transport(transport.clone())
            .handlers(registry)
            .build()
            .unwrap();
        (node, transport)
    }

    fn parse(frame: RawFrame) -> Value {
        match frame {
            RawFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            RawFrame::Binary(_) => panic!("Expected text frame"),
        }
    }

    #[test]
    fn test_response_header_reverses_path() {
        let (relay2, _) = node("Relay2");
        let request = RoutingHeader {
            route: SourceRouting::to(NodeId::from("Relay2")),
            network_path: NetworkPath::from_hops(vec![NodeId::from("Device"), NodeId::from("Relay1")]),
            event_tracking_id: Some(EventTrackingId::from("evt-9")),
            timeout_ms: Some(1000),
            timestamp: None,
        };
        let header = relay2.response_header(&request);
        assert_eq!(header.route.hops(), &[NodeId::from("Relay1"), NodeId::from("Device")]);
        assert_eq!(header.network_path.hops(), &[NodeId::from("Relay2")]);
        assert_eq!(header.event_tracking_id, Some(EventTrackingId::from("evt-9")));
    }

    #[tokio::test]
    async fn test_echo_roundtrip_over_raw_peer() {
        let (node, transport) = node("CSMS");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text(r#"[2, "1", "Echo", {"a": 1}]"#).unwrap();
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply, json!([3, "1", {"a": 1}]));
    }

    #[tokio::test]
    async fn test_malformed_call_is_answered() {
        let (node, transport) = node("CSMS");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text(r#"[2, "7", "Echo"]"#).unwrap();
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "7");
        assert_eq!(reply[2], "FormatViolation");
        assert_eq!(reply[4][RESULT_CODE_KEY], "FormationViolation");
    }

    #[tokio::test]
    async fn test_unanswerable_garbage_is_dropped() {
        let (node, transport) = node("CSMS");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text("not json").unwrap();
        peer.send_text(r#"[3, "5", {}]"#).unwrap();
        peer.send_text(r#"[2, "8", "Echo", {}]"#).unwrap();

        // Only the valid Call gets an answer
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply, json!([3, "8", {}]));
    }

    #[tokio::test]
    async fn test_overlay_response_carries_reverse_route() {
        let (node, transport) = node("CSMS");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text(
            r#"[2, "1", "Echo", {}, {"route": ["CSMS"], "networkPath": ["Device", "Relay1"], "eventTrackingId": "evt"}]"#,
        )
        .unwrap();
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply[3]["route"], json!(["Relay1", "Device"]));
        assert_eq!(reply[3]["networkPath"], json!(["CSMS"]));
        assert_eq!(reply[3]["eventTrackingId"], "evt");

        // The sender of the Call is now a known neighbour
        assert_eq!(node.routes().neighbour_on(peer.connection), Some(NodeId::from("Relay1")));
    }

    #[tokio::test]
    async fn test_unroutable_relay_fails() {
        let (node, transport) = node("Relay1");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text(r#"[2, "3", "Echo", {}, {"route": ["Relay1", "Nowhere"], "networkPath": ["Device"]}]"#)
            .unwrap();
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply[0], 4);
        assert_eq!(reply[4][RESULT_CODE_KEY], "Failed");
        assert!(reply[3].as_str().unwrap().contains("Nowhere"));
    }

    #[tokio::test]
    async fn test_routing_loop_fails() {
        let (node, transport) = node("Relay1");
        let mut peer = connect_raw(&node, &transport);

        peer.send_text(r#"[2, "4", "Echo", {}, {"route": ["Relay1", "CSMS"], "networkPath": ["Relay1", "Device"]}]"#)
            .unwrap();
        let reply = parse(peer.recv().await.unwrap());
        assert_eq!(reply[4][RESULT_CODE_KEY], "Failed");
        assert!(reply[3].as_str().unwrap().contains("loop"));
    }
}
