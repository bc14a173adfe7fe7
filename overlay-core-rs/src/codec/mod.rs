//! OCPP-J envelope framing
//!
//! OCPP uses JSON arrays over WebSocket with a fixed message format:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Overlay frames (sent between networking nodes) append one routing header
//! object to the standard array, e.g. `[2, id, action, payload, {...}]`.
//! A binary encoding of the same three kinds lives in [`binary`].

pub mod binary;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::routing::{NetworkPath, SourceRouting};
use crate::signature::{attach_signatures, split_signatures, Signature};
use crate::types::{EventTrackingId, MessageId, RawFrame, WireFormat};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Elements of a standard (header-less) frame of this kind
    fn standard_arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // OCPP 1.6 spelling of FormatViolation
        if s == "FormationViolation" {
            return Ok(ErrorCode::FormatViolation);
        }
        serde_json::from_value(Value::String(s.to_string())).map_err(|_| ())
    }
}

/// Structural decode failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("JSON parse error: {0}")]
    Json(String),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("empty frame")]
    Empty,

    #[error("message type is not an integer")]
    InvalidDiscriminator,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("wrong arity for {kind:?}: expected {expected} elements (one more with a routing header), got {found}")]
    WrongArity {
        kind: MessageType,
        expected: usize,
        found: usize,
    },

    #[error("invalid field '{0}'")]
    InvalidField(&'static str),

    #[error("invalid routing header: {0}")]
    InvalidHeader(String),

    #[error("binary frame: {0}")]
    Binary(String),
}

/// A frame that could not be decoded, with whatever could be salvaged
/// for an RPC-level error reply
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct DecodeError {
    pub reason: DecodeFailure,
    pub message_type: Option<MessageType>,
    pub message_id: Option<MessageId>,
}

impl DecodeError {
    pub fn new(reason: DecodeFailure) -> Self {
        Self {
            reason,
            message_type: None,
            message_id: None,
        }
    }

    fn at(reason: DecodeFailure, kind: MessageType, message_id: Option<MessageId>) -> Self {
        Self {
            reason,
            message_type: Some(kind),
            message_id,
        }
    }

    /// Broken Call whose sender still expects an answer
    pub fn answerable_call_id(&self) -> Option<&MessageId> {
        match self.message_type {
            Some(MessageType::Call) => self.message_id.as_ref(),
            _ => None,
        }
    }
}

/// Routing metadata carried by overlay frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHeader {
    #[serde(default, skip_serializing_if = "SourceRouting::is_local")]
    pub route: SourceRouting,

    #[serde(default, skip_serializing_if = "NetworkPath::is_empty")]
    pub network_path: NetworkPath,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_tracking_id: Option<EventTrackingId>,

    /// Request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RoutingHeader {
    pub fn new(route: SourceRouting, network_path: NetworkPath) -> Self {
        Self {
            route,
            network_path,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    fn from_value(value: &Value) -> Result<Self, DecodeFailure> {
        if !value.is_object() {
            return Err(DecodeFailure::InvalidHeader("not an object".into()));
        }
        serde_json::from_value(value.clone()).map_err(|e| DecodeFailure::InvalidHeader(e.to_string()))
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: MessageId,
    pub action: String,
    /// Canonical payload, without the `signatures` member
    pub payload: Value,
    pub signatures: Vec<Signature>,
    /// `None` for standard OCPP-J frames
    pub header: Option<RoutingHeader>,
    pub format: WireFormat,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: MessageId::new(),
            action: action.into(),
            payload,
            signatures: Vec::new(),
            header: None,
            format: WireFormat::Json,
        }
    }

    pub fn with_header(mut self, header: RoutingHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn route(&self) -> SourceRouting {
        self.header.as_ref().map(|h| h.route.clone()).unwrap_or_default()
    }

    pub fn network_path(&self) -> NetworkPath {
        self.header.as_ref().map(|h| h.network_path.clone()).unwrap_or_default()
    }

    pub fn event_tracking_id(&self) -> Option<&EventTrackingId> {
        self.header.as_ref().and_then(|h| h.event_tracking_id.as_ref())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.header.as_ref().and_then(|h| h.timeout())
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: MessageId,
    pub payload: Value,
    pub signatures: Vec<Signature>,
    pub header: Option<RoutingHeader>,
    pub format: WireFormat,
}

impl CallResult {
    pub fn new(message_id: MessageId, payload: Value) -> Self {
        Self {
            message_id,
            payload,
            signatures: Vec::new(),
            header: None,
            format: WireFormat::Json,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: MessageId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub header: Option<RoutingHeader>,
    pub format: WireFormat,
}

impl CallError {
    pub fn new(
        message_id: MessageId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
            header: None,
            format: WireFormat::Json,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Decoded OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn header(&self) -> Option<&RoutingHeader> {
        match self {
            Frame::Call(c) => c.header.as_ref(),
            Frame::CallResult(r) => r.header.as_ref(),
            Frame::CallError(e) => e.header.as_ref(),
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            Frame::Call(c) => c.format,
            Frame::CallResult(r) => r.format,
            Frame::CallError(e) => e.format,
        }
    }
}

/// Decode a raw transport frame, picking the codec from the frame kind
pub fn decode(raw: &RawFrame) -> Result<Frame, DecodeError> {
    match raw {
        RawFrame::Text(text) => decode_json(text.as_bytes()),
        RawFrame::Binary(bytes) => binary::decode(bytes),
    }
}

/// Encode a frame with the format recorded on it
pub fn encode(frame: &Frame) -> RawFrame {
    match frame.format() {
        WireFormat::Json => RawFrame::Text(encode_json(frame)),
        WireFormat::Binary => RawFrame::Binary(binary::encode(frame)),
    }
}

/// Serialize to the OCPP-J array form
pub fn encode_json(frame: &Frame) -> String {
    Value::Array(to_elements(frame)).to_string()
}

/// Parse an OCPP-J array
pub fn decode_json(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::new(DecodeFailure::Json(e.to_string())))?;

    let Value::Array(array) = value else {
        return Err(DecodeError::new(DecodeFailure::NotAnArray));
    };

    from_elements(array, WireFormat::Json)
}

fn to_elements(frame: &Frame) -> Vec<Value> {
    let mut elements = match frame {
        Frame::Call(c) => vec![
            Value::from(MessageType::Call as i32),
            Value::String(c.message_id.to_string()),
            Value::String(c.action.clone()),
            attach_signatures(&c.payload, &c.signatures),
        ],
        Frame::CallResult(r) => vec![
            Value::from(MessageType::CallResult as i32),
            Value::String(r.message_id.to_string()),
            attach_signatures(&r.payload, &r.signatures),
        ],
        Frame::CallError(e) => vec![
            Value::from(MessageType::CallError as i32),
            Value::String(e.message_id.to_string()),
            Value::String(e.error_code.to_string()),
            Value::String(e.error_description.clone()),
            e.error_details.clone(),
        ],
    };

    if let Some(header) = frame.header() {
        elements.push(header.to_value());
    }
    elements
}

fn from_elements(array: Vec<Value>, format: WireFormat) -> Result<Frame, DecodeError> {
    let first = array.first().ok_or_else(|| DecodeError::new(DecodeFailure::Empty))?;
    let msg_type = first
        .as_i64()
        .ok_or_else(|| DecodeError::new(DecodeFailure::InvalidDiscriminator))?;
    let kind = MessageType::from_i64(msg_type)
        .ok_or_else(|| DecodeError::new(DecodeFailure::UnknownMessageType(msg_type)))?;

    // Salvage the id early so malformed Calls can still be answered
    let message_id = array.get(1).and_then(Value::as_str).map(MessageId::from);

    let expected = kind.standard_arity();
    if array.len() != expected && array.len() != expected + 1 {
        return Err(DecodeError::at(
            DecodeFailure::WrongArity {
                kind,
                expected,
                found: array.len(),
            },
            kind,
            message_id,
        ));
    }

    let Some(message_id) = message_id else {
        return Err(DecodeError::at(DecodeFailure::InvalidField("messageId"), kind, None));
    };

    let fail = |reason: DecodeFailure| DecodeError::at(reason, kind, Some(message_id.clone()));

    let header = if array.len() == expected + 1 {
        Some(RoutingHeader::from_value(&array[expected]).map_err(fail)?)
    } else {
        None
    };

    match kind {
        MessageType::Call => {
            let action = array[2]
                .as_str()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| fail(DecodeFailure::InvalidField("action")))?
                .to_string();

            if !array[3].is_object() {
                return Err(fail(DecodeFailure::InvalidField("payload")));
            }
            let (payload, signatures) = split_signatures(array[3].clone());

            Ok(Frame::Call(Call {
                message_id,
                action,
                payload,
                signatures,
                header,
                format,
            }))
        }
        MessageType::CallResult => {
            if !array[2].is_object() {
                return Err(fail(DecodeFailure::InvalidField("payload")));
            }
            let (payload, signatures) = split_signatures(array[2].clone());

            Ok(Frame::CallResult(CallResult {
                message_id,
                payload,
                signatures,
                header,
                format,
            }))
        }
        MessageType::CallError => {
            let code_str = array[2]
                .as_str()
                .ok_or_else(|| fail(DecodeFailure::InvalidField("errorCode")))?;

            let mut error_description = array[3]
                .as_str()
                .ok_or_else(|| fail(DecodeFailure::InvalidField("errorDescription")))?
                .to_string();

            let error_code = code_str.parse().unwrap_or_else(|_| {
                if error_description.is_empty() {
                    error_description = code_str.to_string();
                } else {
                    error_description = format!("{}: {}", code_str, error_description);
                }
                ErrorCode::GenericError
            });

            Ok(Frame::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details: array[4].clone(),
                header,
                format,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use serde_json::json;

    fn text(s: &str) -> RawFrame {
        RawFrame::Text(s.to_string())
    }

    #[test]
    fn test_call_serialization() {
        let call = Call::new("Heartbeat", json!({}));
        let text = encode_json(&Frame::Call(call));

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let msg = decode(&text(r#"[2, "msg-123", "Heartbeat", {}]"#)).unwrap();

        match msg {
            Frame::Call(call) => {
                assert_eq!(call.message_id.as_str(), "msg-123");
                assert_eq!(call.action, "Heartbeat");
                assert!(call.header.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_empty_signature_list_survives_reencoding() {
        let frame = decode(&text(r#"[2,"1","DataTransfer",{"signatures":[],"vendorId":"EK"}]"#)).unwrap();
        let Frame::Call(call) = &frame else {
            panic!("Expected Call");
        };
        assert!(call.signatures.is_empty());
        assert_eq!(call.payload["signatures"], json!([]));
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
        assert!(encode_json(&frame).contains("\"signatures\":[]"));
    }

    #[test]
    fn test_call_result_parsing() {
        let msg = decode(&text(r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#)).unwrap();

        match msg {
            Frame::CallResult(result) => {
                assert_eq!(result.message_id.as_str(), "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let msg = decode(&text(r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#)).unwrap();

        match msg {
            Frame::CallError(error) => {
                assert_eq!(error.message_id.as_str(), "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_error_code_is_kept_in_description() {
        let msg = decode(&text(r#"[4, "1", "VendorSpecific", "boom", {}]"#)).unwrap();
        let Frame::CallError(error) = msg else { panic!("Expected CallError") };
        assert_eq!(error.error_code, ErrorCode::GenericError);
        assert_eq!(error.error_description, "VendorSpecific: boom");
    }

    #[test]
    fn test_legacy_formation_violation_code() {
        assert_eq!("FormationViolation".parse(), Ok(ErrorCode::FormatViolation));
    }

    #[test]
    fn test_overlay_header_roundtrip() {
        let header = RoutingHeader {
            route: SourceRouting::to(NodeId::from("CSMS")),
            network_path: NetworkPath::from_origin(NodeId::from("Device")),
            event_tracking_id: Some(EventTrackingId::from("evt-1")),
            timeout_ms: Some(30_000),
            timestamp: None,
        };
        let call = Call::new("Heartbeat", json!({})).with_header(header.clone());
        let encoded = encode(&Frame::Call(call.clone()));

        let RawFrame::Text(ref s) = encoded else { panic!("Expected text frame") };
        assert!(s.contains("\"networkPath\":[\"Device\"]"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, Frame::Call(call));
        assert_eq!(decoded.header(), Some(&header));
    }

    #[test]
    fn test_wrong_arity_salvages_call_id() {
        let err = decode(&text(r#"[2, "42", "Heartbeat"]"#)).unwrap_err();
        assert!(matches!(err.reason, DecodeFailure::WrongArity { .. }));
        assert_eq!(err.answerable_call_id(), Some(&MessageId::from("42")));
    }

    #[test]
    fn test_structural_violations() {
        let cases = [
            (r#"{"not": "array"}"#, DecodeFailure::NotAnArray),
            ("[]", DecodeFailure::Empty),
            (r#"["2", "1", "A", {}]"#, DecodeFailure::InvalidDiscriminator),
            (r#"[7, "1", {}]"#, DecodeFailure::UnknownMessageType(7)),
        ];
        for (input, expected) in cases {
            let err = decode(&text(input)).unwrap_err();
            assert_eq!(err.reason, expected, "input: {}", input);
            assert!(err.answerable_call_id().is_none());
        }

        let err = decode(&text("[2, \"1\", ")).unwrap_err();
        assert!(matches!(err.reason, DecodeFailure::Json(_)));
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let err = decode(&text(r#"[2, "9", "Heartbeat", [1, 2]]"#)).unwrap_err();
        assert_eq!(err.reason, DecodeFailure::InvalidField("payload"));
        assert_eq!(err.answerable_call_id(), Some(&MessageId::from("9")));
    }

    #[test]
    fn test_bad_header_is_a_decode_error() {
        let err = decode(&text(r#"[3, "9", {}, "not-a-header"]"#)).unwrap_err();
        assert!(matches!(err.reason, DecodeFailure::InvalidHeader(_)));
        assert!(err.answerable_call_id().is_none());
    }
}
