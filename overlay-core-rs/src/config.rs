//! Node configuration
//!
//! Engine settings plus the key material and WebSocket endpoints a
//! networking node needs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::signature::{
    KeyPolicy, NoSignatures, PublicKey, SignaturePolicy, SigningError, SigningKeyPair, StaticKeyStore,
};
use crate::types::{NodeId, WireFormat};

/// OCPP WebSocket subprotocols, most preferred first
pub const DEFAULT_SUBPROTOCOLS: &[&str] = &["ocpp2.1", "ocpp2.0.1"];

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Node identity
    pub node_id: String,

    /// Timeout for outbound requests without an explicit one
    pub request_timeout: Duration,

    /// How often the pending table is swept for expired requests
    pub sweep_interval: Duration,

    /// Framing for requests this node originates
    pub wire_format: WireFormat,

    pub signatures: SignatureConfig,

    pub websocket: WebSocketConfig,
}

/// Key material and signing rules
#[derive(Debug, Clone, Default)]
pub struct SignatureConfig {
    /// Hex encoded 32 byte Ed25519 seed
    pub signing_seed: Option<String>,

    /// Hex encoded public keys whose signatures are accepted
    pub trusted_keys: Vec<String>,

    /// Reject inbound messages without a valid trusted signature
    pub require_all: bool,

    /// Actions that must carry a valid trusted signature
    pub required_actions: Vec<String>,
}

/// WebSocket endpoints
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to accept downstream connections on
    pub listen_addr: Option<SocketAddr>,

    /// Upstream base URL (node id is appended)
    pub upstream_url: Option<String>,

    /// Node id of the upstream peer
    pub upstream_id: Option<String>,

    pub subprotocols: Vec<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    pub max_message_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "overlay-node".to_string(),
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            wire_format: WireFormat::Json,
            signatures: SignatureConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            upstream_url: None,
            upstream_id: None,
            subprotocols: DEFAULT_SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 64 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Sign outbound payloads with this seed
    pub fn with_signing_seed(mut self, seed: impl Into<String>) -> Self {
        self.signatures.signing_seed = Some(seed.into());
        self
    }

    /// Accept signatures by this public key
    pub fn with_trusted_key(mut self, key: impl Into<String>) -> Self {
        self.signatures.trusted_keys.push(key.into());
        self
    }

    pub fn require_signatures(mut self) -> Self {
        self.signatures.require_all = true;
        self
    }

    pub fn require_signature_for(mut self, action: impl Into<String>) -> Self {
        self.signatures.required_actions.push(action.into());
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.websocket.listen_addr = Some(addr);
        self
    }

    /// Connect upstream to `url`, expecting the peer to be `node_id`
    pub fn with_upstream(mut self, url: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.websocket.upstream_url = Some(url.into());
        self.websocket.upstream_id = Some(node_id.into());
        self
    }

    /// Build the signature policy described by this configuration
    pub fn signature_policy(&self) -> Result<Arc<dyn SignaturePolicy>, SigningError> {
        let sig = &self.signatures;
        if sig.signing_seed.is_none()
            && sig.trusted_keys.is_empty()
            && !sig.require_all
            && sig.required_actions.is_empty()
        {
            return Ok(Arc::new(NoSignatures));
        }

        let mut store = StaticKeyStore::new();
        if let Some(seed) = &sig.signing_seed {
            store = store.with_signing_key(SigningKeyPair::from_hex(seed)?);
        }
        for key in &sig.trusted_keys {
            store = store.with_trusted_key(PublicKey::from_hex(key)?);
        }

        let mut policy = KeyPolicy::new(Arc::new(store));
        if sig.require_all {
            policy = policy.require_all_signatures();
        }
        for action in &sig.required_actions {
            policy = policy.require_signature_for(action.clone());
        }
        Ok(Arc::new(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("relay-1")
            .with_request_timeout(Duration::from_secs(10))
            .with_wire_format(WireFormat::Binary)
            .with_upstream("ws://csms:9000/ocpp", "CSMS")
            .require_signature_for("RequestStartTransaction");

        assert_eq!(config.node_id(), NodeId::from("relay-1"));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert_eq!(config.websocket.upstream_id.as_deref(), Some("CSMS"));
        assert_eq!(config.websocket.subprotocols, vec!["ocpp2.1", "ocpp2.0.1"]);
        assert_eq!(config.signatures.required_actions, vec!["RequestStartTransaction"]);
    }

    #[test]
    fn test_signature_policy_from_config() {
        assert!(NodeConfig::default().signature_policy().is_ok());

        let seed = "01".repeat(32);
        let public = SigningKeyPair::from_hex(&seed).unwrap().key_id();
        let config = NodeConfig::new("n").with_signing_seed(seed).with_trusted_key(public);
        assert!(config.signature_policy().is_ok());

        let broken = NodeConfig::new("n").with_trusted_key("not-hex");
        assert!(matches!(broken.signature_policy(), Err(SigningError::InvalidKey(_))));
    }
}
