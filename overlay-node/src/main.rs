//! Overlay Node - CLI for an OCPP networking node
//!
//! Runs a station, relay or CSMS on the OCPP-J overlay.
//!
//! # Usage
//!
//! ```bash
//! # CSMS answering the core messages itself
//! overlay-node --id CSMS --listen 0.0.0.0:9000 --csms
//!
//! # Relay between stations and the CSMS
//! overlay-node --id Relay1 --listen 0.0.0.0:9100 \
//!     --upstream-url ws://localhost:9000/ocpp --upstream-id CSMS
//!
//! # Require signed messages from a trusted key
//! overlay-node --id CSMS --listen 0.0.0.0:9000 --csms \
//!     --signing-seed <64 hex chars> --trust <64 hex chars> --require-signatures
//! ```
//!
//! # Demo Scenario
//!
//! 1. Start the CSMS, then one or more relays pointing upstream at it
//! 2. Connect stations to a relay at `ws://<relay>/ocpp/<station-id>`
//! 3. Calls routed to `CSMS` are forwarded hop by hop
//! 4. Responses travel back along the reversed network path

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use overlay_core::messages::{
    BootNotificationRequest, BootNotificationResponse, DataTransferRequest, DataTransferResponse,
    DataTransferStatus, HeartbeatRequest, HeartbeatResponse, RegistrationStatus, StatusNotificationRequest,
    StatusNotificationResponse,
};
use overlay_core::transport::ws::{run_upstream, serve};
use overlay_core::transport::WsTransport;
use overlay_core::{HandlerRegistry, Node, NodeConfig, SigningKeyPair};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Heartbeat interval handed out to booting stations, in seconds
const HEARTBEAT_INTERVAL: i32 = 300;

/// OCPP overlay networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long)]
    id: String,

    /// Accept downstream connections on this address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Upstream WebSocket base URL (the node id is appended)
    #[arg(long, requires = "upstream_id")]
    upstream_url: Option<String>,

    /// Node id of the upstream peer
    #[arg(long, requires = "upstream_url")]
    upstream_id: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Hex encoded 32 byte Ed25519 seed for signing
    #[arg(long)]
    signing_seed: Option<String>,

    /// Hex encoded public key whose signatures are trusted (can be repeated)
    #[arg(long)]
    trust: Vec<String>,

    /// Reject messages without a valid trusted signature
    #[arg(long)]
    require_signatures: bool,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Answer BootNotification, Heartbeat, StatusNotification and DataTransfer
    #[arg(long)]
    csms: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = build_config(&args);
    if let Some(seed) = &config.signatures.signing_seed {
        info!("Signing key: {}", SigningKeyPair::from_hex(seed)?.key_id());
    }

    let transport = WsTransport::new(config.websocket.clone());
    let mut builder = Node::builder(config.clone()).transport(transport.clone());
    if args.csms {
        builder = builder.handlers(csms_handlers());
    }
    let node = builder.build()?;
    let sweeper = node.spawn_sweeper();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               Overlay Node - OCPP Networking Node            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.id);
    println!("║  Role:     {:<50} ║", if args.csms { "CSMS" } else { "relay" });
    println!("║  Listen:   {:<50} ║", args.listen.map(|a| a.to_string()).unwrap_or_else(|| "-".into()));
    println!("║  Upstream: {:<50} ║", truncate(args.upstream_url.as_deref().unwrap_or("-"), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if let Some(addr) = config.websocket.listen_addr {
        let listener = TcpListener::bind(addr).await?;
        let (node, transport) = (node.clone(), transport.clone());
        tokio::spawn(async move {
            if let Err(e) = serve(node, transport, listener).await {
                error!("Server stopped: {}", e);
            }
        });
    }

    if config.websocket.upstream_url.is_some() {
        let (node, transport) = (node.clone(), transport.clone());
        tokio::spawn(async move {
            if let Err(e) = run_upstream(node, transport).await {
                error!("Upstream stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down ({} requests pending)", node.pending().len());
    sweeper.abort();

    Ok(())
}

fn build_config(args: &Args) -> NodeConfig {
    let mut config = NodeConfig::new(&args.id).with_request_timeout(Duration::from_secs(args.timeout));

    if let Some(addr) = args.listen {
        config = config.with_listen_addr(addr);
    }
    if let (Some(url), Some(id)) = (&args.upstream_url, &args.upstream_id) {
        config = config.with_upstream(url, id);
    }
    if let Some(seed) = &args.signing_seed {
        config = config.with_signing_seed(seed);
    }
    for key in &args.trust {
        config = config.with_trusted_key(key);
    }
    if args.require_signatures {
        config = config.require_signatures();
    }
    config
}

/// Handlers for the CSMS role
fn csms_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    handlers
        .register::<BootNotificationRequest, _, _>(|ctx, request| async move {
            info!(
                "BootNotification from {:?}: {} {} ({:?})",
                ctx.network_path.origin(),
                request.charging_station.vendor_name,
                request.charging_station.model,
                request.reason
            );
            Ok(Some(BootNotificationResponse {
                current_time: Utc::now(),
                interval: HEARTBEAT_INTERVAL,
                status: RegistrationStatus::Accepted,
                status_info: None,
            }))
        })
        .register::<HeartbeatRequest, _, _>(|_, _| async {
            Ok(Some(HeartbeatResponse { current_time: Utc::now() }))
        })
        .register::<StatusNotificationRequest, _, _>(|ctx, request| async move {
            info!(
                "EVSE {}/{} of {:?} is {:?}",
                request.evse_id,
                request.connector_id,
                ctx.network_path.origin(),
                request.connector_status
            );
            Ok(Some(StatusNotificationResponse {}))
        })
        .register::<DataTransferRequest, _, _>(|_, request| async move {
            info!("DataTransfer from vendor {}", request.vendor_id);
            Ok(Some(DataTransferResponse::status(DataTransferStatus::UnknownVendorId)))
        });

    handlers
}

/// Truncate string with ellipsis, counting characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
    format!("{}...", &s[..end])
}
