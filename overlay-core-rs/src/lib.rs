//! # OCPP Overlay Core
//!
//! Bidirectional OCPP-J RPC engine for charging stations, relays
//! (networking nodes) and central systems.
//!
//! Every node both sends and answers Calls. Overlay frames carry a routing
//! header with the source route, the network path travelled so far and an
//! event tracking id, so a request can cross several relays and its
//! response comes back the same way in reverse.
//!
//! ## Architecture
//!
//! ```text
//!  Device ──► Relay1 ──► Relay2 ──► CSMS
//!    ▲          │          │          │
//!    └──────────┴──────────┴──────────┘
//!          response on reversed path
//!
//! ┌─────────────────────────────────────────────┐
//! │  Node                                       │
//! │  codec ─► dispatch ─► registry (handlers)   │
//! │             │  └────► relay (forward)       │
//! │   signature │ correlation │ routing         │
//! └─────────────┴─────────────┴─────────────────┘
//!        ▲ RawFrame                 │ RawFrame
//!        │                          ▼
//!   Transport (WebSocket / in-memory channels)
//! ```
//!
//! ## Response taxonomy
//!
//! | Result              | Wire                              |
//! |---------------------|-----------------------------------|
//! | Success             | CallResult                        |
//! | RequestError        | CallError from the handler chain  |
//! | FormationViolation  | CallError `FormatViolation`       |
//! | SignatureError      | CallError `SecurityError`         |
//! | Failed              | CallError (`NotImplemented`, ...) |
//! | ExceptionOccurred   | CallError `InternalError`         |
//!
//! ## Usage
//!
//! ```no_run
//! use overlay_core::messages::{HeartbeatRequest, HeartbeatResponse};
//! use overlay_core::transport::{link, ChannelTransport};
//! use overlay_core::{HandlerRegistry, Node, NodeConfig, SourceRouting};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.register::<HeartbeatRequest, _, _>(|_, _| async {
//!         Ok(Some(HeartbeatResponse { current_time: chrono::Utc::now() }))
//!     });
//!
//!     let csms_transport = ChannelTransport::new();
//!     let csms = Node::builder(NodeConfig::new("CSMS"))
//!         .transport(csms_transport.clone())
//!         .handlers(handlers)
//!         .build()?;
//!
//!     let device_transport = ChannelTransport::new();
//!     let device = Node::builder(NodeConfig::new("Device"))
//!         .transport(device_transport.clone())
//!         .build()?;
//!
//!     let _link = link(&device, &device_transport, &csms, &csms_transport);
//!     let response = device
//!         .request_routed(SourceRouting::to("CSMS".into()), &HeartbeatRequest {})
//!         .await?;
//!     println!("CSMS time: {}", response.current_time);
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod correlation;
mod dispatch;
pub mod messages;
pub mod node;
pub mod observer;
pub mod outcome;
pub mod registry;
pub mod routing;
pub mod signature;
pub mod transport;
pub mod types;

pub use codec::{Call, CallError, CallResult, ErrorCode, Frame, RoutingHeader};
pub use config::NodeConfig;
pub use node::{BuildError, Node, NodeBuilder};
pub use observer::{Observer, TracingObserver};
pub use outcome::{CallFailure, Outcome, RemoteError, ResultCode};
pub use registry::{HandlerError, HandlerRegistry, OcppRequest, RequestContext};
pub use routing::{NetworkPath, RouteTable, RoutingError, SourceRouting};
pub use signature::{KeyPolicy, NoSignatures, SignaturePolicy, SignatureState, SigningKeyPair, StaticKeyStore};
pub use transport::{Transport, TransportError};
pub use types::{ConnectionId, EventTrackingId, MessageId, NodeId, RawFrame, WireFormat};
