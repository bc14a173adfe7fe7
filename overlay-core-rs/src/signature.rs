//! Payload signing and verification
//!
//! Signatures travel inside the payload object under `"signatures"` and
//! cover the canonical form of the rest of the payload: compact JSON with
//! object keys sorted. Each signature is Ed25519 over the SHA-256 digest of
//! those bytes.
//!
//! The engine only talks to the [`SignaturePolicy`] trait. [`KeyPolicy`] is
//! the rule-based implementation backed by a [`KeyStore`]; [`NoSignatures`]
//! passes everything through unsigned.

use std::collections::HashSet;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{Call, CallResult};

/// Signing method recorded on every signature this module produces
pub const SIGNING_METHOD: &str = "Ed25519-SHA256";

const SIGNATURES_KEY: &str = "signatures";

/// One signature attached to a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Hex encoded public key of the signer
    pub key_id: String,
    pub signing_method: String,
    /// Hex encoded signature bytes
    pub value: String,
}

/// Why a payload failed verification
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationFailure {
    #[error("signature required but none present")]
    Missing,

    #[error("no signature by a trusted key")]
    UntrustedKeys,

    #[error("invalid signature by key {key_id}")]
    Invalid { key_id: String },

    #[error("unsupported signing method {0}")]
    UnsupportedMethod(String),
}

/// Errors raised while signing outbound payloads or loading keys
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("signature mandated for {action} but no signing key is configured")]
    NoSigningKey { action: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Signature status of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    Unsigned,
    Signed { key_ids: Vec<String> },
    Verified { key_id: String },
    VerificationFailed(VerificationFailure),
}

impl SignatureState {
    pub fn is_failure(&self) -> bool {
        matches!(self, SignatureState::VerificationFailed(_))
    }
}

/// Ed25519 signing key
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Create from a 32 byte secret seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Create from a hex encoded 32 byte seed
    pub fn from_hex(seed: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(seed.trim()).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    pub fn key_id(&self) -> String {
        self.public_key().key_id()
    }

    fn sign_digest(&self, digest: &[u8]) -> Signature {
        let sig = self.signing_key.sign(digest);
        Signature {
            key_id: self.key_id(),
            signing_method: SIGNING_METHOD.to_string(),
            value: hex::encode(sig.to_bytes()),
        }
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair").field("key_id", &self.key_id()).finish()
    }
}

/// Ed25519 verification key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(key: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(key.trim()).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("public key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))
    }

    pub fn key_id(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    fn verify_digest(&self, digest: &[u8], signature: &Signature) -> Result<(), VerificationFailure> {
        let invalid = || VerificationFailure::Invalid {
            key_id: signature.key_id.clone(),
        };
        if signature.signing_method != SIGNING_METHOD {
            return Err(VerificationFailure::UnsupportedMethod(signature.signing_method.clone()));
        }
        let bytes = hex::decode(&signature.value).map_err(|_| invalid())?;
        let sig = ed25519_dalek::Signature::from_slice(&bytes).map_err(|_| invalid())?;
        self.0.verify(digest, &sig).map_err(|_| invalid())
    }
}

/// Source of key material; supplied by configuration or a secret store
pub trait KeyStore: Send + Sync {
    fn signing_keys(&self) -> Vec<SigningKeyPair>;
    fn trusted_verification_keys(&self) -> Vec<PublicKey>;
}

/// Key store holding keys in memory
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    signing: Vec<SigningKeyPair>,
    trusted: Vec<PublicKey>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signing_key(mut self, key: SigningKeyPair) -> Self {
        self.signing.push(key);
        self
    }

    pub fn with_trusted_key(mut self, key: PublicKey) -> Self {
        self.trusted.push(key);
        self
    }
}

impl KeyStore for StaticKeyStore {
    fn signing_keys(&self) -> Vec<SigningKeyPair> {
        self.signing.clone()
    }

    fn trusted_verification_keys(&self) -> Vec<PublicKey> {
        self.trusted.clone()
    }
}

/// Pluggable signing and verification of request/response payloads
pub trait SignaturePolicy: Send + Sync {
    /// Check an inbound Call; never returns `Signed`
    fn verify_request(&self, call: &Call) -> SignatureState;

    /// Check an inbound CallResult answering `action`
    fn verify_response(&self, action: &str, result: &CallResult) -> SignatureState;

    /// Attach signatures to an outbound Call
    fn sign_request(&self, call: &mut Call) -> Result<SignatureState, SigningError>;

    /// Attach signatures to an outbound CallResult answering `action`
    fn sign_response(&self, action: &str, result: &mut CallResult) -> Result<SignatureState, SigningError>;
}

/// Policy that neither signs nor checks anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignatures;

impl SignaturePolicy for NoSignatures {
    fn verify_request(&self, _call: &Call) -> SignatureState {
        SignatureState::Unsigned
    }

    fn verify_response(&self, _action: &str, _result: &CallResult) -> SignatureState {
        SignatureState::Unsigned
    }

    fn sign_request(&self, _call: &mut Call) -> Result<SignatureState, SigningError> {
        Ok(SignatureState::Unsigned)
    }

    fn sign_response(&self, _action: &str, _result: &mut CallResult) -> Result<SignatureState, SigningError> {
        Ok(SignatureState::Unsigned)
    }
}

/// Rule-based policy over a key store
///
/// - outbound: signs with every configured signing key (when `sign_outbound`),
///   fails for mandated actions when no key exists
/// - inbound: a signature by a trusted key must verify; signatures by unknown
///   keys are ignored; actions listed as required must carry at least one
///   valid trusted signature
pub struct KeyPolicy {
    keys: Arc<dyn KeyStore>,
    sign_outbound: bool,
    require_all: bool,
    required_inbound: HashSet<String>,
    mandated_outbound: HashSet<String>,
}

impl KeyPolicy {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self {
            keys,
            sign_outbound: true,
            require_all: false,
            required_inbound: HashSet::new(),
            mandated_outbound: HashSet::new(),
        }
    }

    /// Do not sign unless an action is mandated
    pub fn without_default_signing(mut self) -> Self {
        self.sign_outbound = false;
        self
    }

    /// Require a valid signature on every inbound message
    pub fn require_all_signatures(mut self) -> Self {
        self.require_all = true;
        self
    }

    /// Require a valid signature on inbound messages for `action`
    pub fn require_signature_for(mut self, action: impl Into<String>) -> Self {
        self.required_inbound.insert(action.into());
        self
    }

    /// Outbound messages for `action` must be signed
    pub fn mandate_signing_for(mut self, action: impl Into<String>) -> Self {
        self.mandated_outbound.insert(action.into());
        self
    }

    fn verify(&self, action: &str, payload: &Value, signatures: &[Signature]) -> SignatureState {
        let required = self.require_all || self.required_inbound.contains(action);

        if signatures.is_empty() {
            return if required {
                SignatureState::VerificationFailed(VerificationFailure::Missing)
            } else {
                SignatureState::Unsigned
            };
        }

        let trusted = self.keys.trusted_verification_keys();
        let digest = canonical_digest(payload);
        let mut verified_by = None;

        for signature in signatures {
            let Some(key) = trusted.iter().find(|k| k.key_id() == signature.key_id) else {
                debug!("Ignoring signature by untrusted key {}", signature.key_id);
                continue;
            };
            if let Err(failure) = key.verify_digest(&digest, signature) {
                warn!("Signature check failed for {}: {}", action, failure);
                return SignatureState::VerificationFailed(failure);
            }
            verified_by.get_or_insert_with(|| signature.key_id.clone());
        }

        match verified_by {
            Some(key_id) => SignatureState::Verified { key_id },
            None if required => SignatureState::VerificationFailed(VerificationFailure::UntrustedKeys),
            None => SignatureState::Unsigned,
        }
    }

    fn sign(
        &self,
        action: &str,
        payload: &Value,
        signatures: &mut Vec<Signature>,
    ) -> Result<SignatureState, SigningError> {
        let mandated = self.mandated_outbound.contains(action);
        if !self.sign_outbound && !mandated {
            return Ok(SignatureState::Unsigned);
        }

        let keys = self.keys.signing_keys();
        if keys.is_empty() {
            if mandated {
                return Err(SigningError::NoSigningKey {
                    action: action.to_string(),
                });
            }
            return Ok(SignatureState::Unsigned);
        }

        let digest = canonical_digest(payload);
        let mut key_ids = Vec::with_capacity(keys.len());
        for key in &keys {
            let key_id = key.key_id();
            signatures.retain(|s| s.key_id != key_id);
            signatures.push(key.sign_digest(&digest));
            key_ids.push(key_id);
        }
        Ok(SignatureState::Signed { key_ids })
    }
}

impl SignaturePolicy for KeyPolicy {
    fn verify_request(&self, call: &Call) -> SignatureState {
        self.verify(&call.action, &call.payload, &call.signatures)
    }

    fn verify_response(&self, action: &str, result: &CallResult) -> SignatureState {
        self.verify(action, &result.payload, &result.signatures)
    }

    fn sign_request(&self, call: &mut Call) -> Result<SignatureState, SigningError> {
        self.sign(&call.action, &call.payload, &mut call.signatures)
    }

    fn sign_response(&self, action: &str, result: &mut CallResult) -> Result<SignatureState, SigningError> {
        self.sign(action, &result.payload, &mut result.signatures)
    }
}

/// SHA-256 over the canonical payload bytes. Only the top-level
/// `signatures` member is left out; nested members of that name are signed
/// like any other data.
pub fn canonical_digest(payload: &Value) -> [u8; 32] {
    let mut bytes = Vec::with_capacity(256);
    match payload {
        Value::Object(map) if map.contains_key(SIGNATURES_KEY) => {
            let mut unsigned = map.clone();
            unsigned.remove(SIGNATURES_KEY);
            write_canonical(&Value::Object(unsigned), &mut bytes);
        }
        _ => write_canonical(payload, &mut bytes),
    }
    Sha256::digest(&bytes).into()
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Lift the `signatures` member out of a payload. A member that does not
/// parse as a non-empty signature list stays in the payload untouched.
pub(crate) fn split_signatures(mut payload: Value) -> (Value, Vec<Signature>) {
    let Some(map) = payload.as_object_mut() else {
        return (payload, Vec::new());
    };
    let parsed = map
        .get(SIGNATURES_KEY)
        .map(|v| serde_json::from_value::<Vec<Signature>>(v.clone()));

    match parsed {
        Some(Ok(signatures)) if !signatures.is_empty() => {
            map.remove(SIGNATURES_KEY);
            (payload, signatures)
        }
        _ => (payload, Vec::new()),
    }
}

/// Payload as sent on the wire, signatures included
pub(crate) fn attach_signatures(payload: &Value, signatures: &[Signature]) -> Value {
    if signatures.is_empty() {
        return payload.clone();
    }
    let mut payload = payload.clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            SIGNATURES_KEY.to_string(),
            serde_json::to_value(signatures).unwrap_or(Value::Null),
        );
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(byte: u8) -> SigningKeyPair {
        SigningKeyPair::from_seed([byte; 32])
    }

    fn policy_with(signing: Option<SigningKeyPair>, trusted: &[PublicKey]) -> KeyPolicy {
        let mut store = StaticKeyStore::new();
        if let Some(k) = signing {
            store = store.with_signing_key(k);
        }
        for t in trusted {
            store = store.with_trusted_key(*t);
        }
        KeyPolicy::new(Arc::new(store))
    }

    #[test]
    fn test_canonical_digest_ignores_key_order_and_signatures() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        let b = json!({"a": {"x": "s", "y": [1, 2]}, "b": 1, "signatures": []});
        assert_eq!(canonical_digest(&a), canonical_digest(&b));
        assert_ne!(canonical_digest(&a), canonical_digest(&json!({"b": 2})));
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = key(1);
        let public = signer.public_key();
        let outbound = policy_with(Some(signer), &[]);
        let inbound = policy_with(None, &[public]).require_signature_for("Authorize");

        let mut call = Call::new("Authorize", json!({"idToken": {"idToken": "abc", "type": "ISO14443"}}));
        let state = outbound.sign_request(&mut call).unwrap();
        assert!(matches!(state, SignatureState::Signed { ref key_ids } if key_ids.len() == 1));

        assert_eq!(
            inbound.verify_request(&call),
            SignatureState::Verified { key_id: public.key_id() }
        );
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signer = key(2);
        let public = signer.public_key();
        let outbound = policy_with(Some(signer), &[]);
        let inbound = policy_with(None, &[public]);

        let mut call = Call::new("DataTransfer", json!({"vendorId": "EK", "data": "1"}));
        outbound.sign_request(&mut call).unwrap();
        call.payload["data"] = json!("2");

        assert_eq!(
            inbound.verify_request(&call),
            SignatureState::VerificationFailed(VerificationFailure::Invalid { key_id: public.key_id() })
        );
    }

    #[test]
    fn test_nested_signatures_member_is_signed() {
        let signer = key(6);
        let public = signer.public_key();
        let outbound = policy_with(Some(signer), &[]);
        let inbound = policy_with(None, &[public]).require_all_signatures();

        let mut call = Call::new(
            "DataTransfer",
            json!({"vendorId": "EK", "data": {"signatures": "approved-by-alice"}}),
        );
        outbound.sign_request(&mut call).unwrap();
        call.payload["data"]["signatures"] = json!("approved-by-mallory");

        assert_eq!(
            inbound.verify_request(&call),
            SignatureState::VerificationFailed(VerificationFailure::Invalid { key_id: public.key_id() })
        );
    }

    #[test]
    fn test_missing_signature_when_required() {
        let policy = policy_with(None, &[]).require_all_signatures();
        let call = Call::new("Heartbeat", json!({}));
        assert_eq!(
            policy.verify_request(&call),
            SignatureState::VerificationFailed(VerificationFailure::Missing)
        );
    }

    #[test]
    fn test_untrusted_signature_ignored_unless_required() {
        let stranger = key(3);
        let mut call = Call::new("Heartbeat", json!({}));
        policy_with(Some(stranger), &[]).sign_request(&mut call).unwrap();

        let lenient = policy_with(None, &[key(4).public_key()]);
        assert_eq!(lenient.verify_request(&call), SignatureState::Unsigned);

        let strict = policy_with(None, &[key(4).public_key()]).require_signature_for("Heartbeat");
        assert_eq!(
            strict.verify_request(&call),
            SignatureState::VerificationFailed(VerificationFailure::UntrustedKeys)
        );
    }

    #[test]
    fn test_signing_without_keys() {
        let mut call = Call::new("Heartbeat", json!({}));
        let lenient = policy_with(None, &[]);
        assert_eq!(lenient.sign_request(&mut call), Ok(SignatureState::Unsigned));
        assert!(call.signatures.is_empty());

        let mandated = policy_with(None, &[]).mandate_signing_for("Heartbeat");
        assert_eq!(
            mandated.sign_request(&mut call),
            Err(SigningError::NoSigningKey { action: "Heartbeat".into() })
        );
    }

    #[test]
    fn test_resigning_replaces_own_signature() {
        let policy = policy_with(Some(key(5)), &[]);
        let mut result = CallResult::new("1".into(), json!({"status": "Accepted"}));
        policy.sign_response("Reset", &mut result).unwrap();
        policy.sign_response("Reset", &mut result).unwrap();
        assert_eq!(result.signatures.len(), 1);
    }

    #[test]
    fn test_split_and_attach() {
        let sig = Signature {
            key_id: "ab".into(),
            signing_method: SIGNING_METHOD.into(),
            value: "cd".into(),
        };
        let wire = attach_signatures(&json!({"a": 1}), std::slice::from_ref(&sig));
        assert_eq!(wire["signatures"][0]["keyId"], "ab");

        let (payload, signatures) = split_signatures(wire);
        assert_eq!(payload, json!({"a": 1}));
        assert_eq!(signatures, vec![sig]);

        let (payload, signatures) = split_signatures(json!({"signatures": "garbage"}));
        assert_eq!(payload, json!({"signatures": "garbage"}));
        assert!(signatures.is_empty());

        let (payload, signatures) = split_signatures(json!({"a": 1, "signatures": []}));
        assert_eq!(payload, json!({"a": 1, "signatures": []}));
        assert!(signatures.is_empty());
    }

    #[test]
    fn test_key_hex_parsing() {
        let pair = SigningKeyPair::from_hex(&"11".repeat(32)).unwrap();
        let public = PublicKey::from_hex(&pair.key_id()).unwrap();
        assert_eq!(public, pair.public_key());
        assert!(SigningKeyPair::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }
}
