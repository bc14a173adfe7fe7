//! Binary framing of the three OCPP-J message kinds
//!
//! ```text
//! u8  message type (2, 3, 4)
//! u8  flags (bit 0: routing header follows)
//! then per kind, each field u32-BE length prefixed:
//!   Call:       messageId, action, payload(JSON)
//!   CallResult: messageId, payload(JSON)
//!   CallError:  messageId, errorCode, errorDescription, errorDetails(JSON)
//! [header(JSON)]
//! ```
//!
//! Decoding rebuilds the element list and runs it through the same
//! validation as the JSON codec, so both framings accept exactly the same
//! messages.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::Value;

use super::{from_elements, to_elements, DecodeError, DecodeFailure, Frame, MessageType};
use crate::types::{MessageId, WireFormat};

const FLAG_HEADER: u8 = 0x01;

/// Upper bound for a single field, guards allocations on corrupt input
const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Clone, Copy)]
enum Field {
    Text,
    Json,
}

fn layout(kind: MessageType) -> &'static [Field] {
    match kind {
        MessageType::Call => &[Field::Text, Field::Text, Field::Json],
        MessageType::CallResult => &[Field::Text, Field::Json],
        MessageType::CallError => &[Field::Text, Field::Text, Field::Text, Field::Json],
    }
}

/// Serialize a frame to its binary form
pub fn encode(frame: &Frame) -> Vec<u8> {
    let kind = frame.message_type();
    let elements = to_elements(frame);
    let fields = layout(kind);

    let mut buf = Vec::with_capacity(128);
    buf.push(kind as u8);
    buf.push(if frame.header().is_some() { FLAG_HEADER } else { 0 });

    for (element, field) in elements.iter().skip(1).zip(fields) {
        match field {
            Field::Text => write_blob(&mut buf, element.as_str().unwrap_or_default().as_bytes()),
            Field::Json => write_blob(&mut buf, element.to_string().as_bytes()),
        }
    }

    if let Some(header) = elements.get(fields.len() + 1) {
        write_blob(&mut buf, header.to_string().as_bytes());
    }
    buf
}

/// Parse a binary frame
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let msg_type = cursor.read_u8().map_err(|_| DecodeError::new(DecodeFailure::Empty))?;
    let kind = MessageType::from_i64(msg_type as i64)
        .ok_or_else(|| DecodeError::new(DecodeFailure::UnknownMessageType(msg_type as i64)))?;
    let flags = cursor.read_u8().map_err(|_| truncated(kind))?;

    let mut elements = vec![Value::from(msg_type)];
    for field in layout(kind) {
        let message_id = elements.get(1).and_then(Value::as_str).map(MessageId::from);
        let value = read_blob(&mut cursor)
            .and_then(|blob| to_value(*field, blob))
            .map_err(|reason| DecodeError {
                reason,
                message_type: Some(kind),
                message_id,
            })?;
        elements.push(value);
    }

    if flags & FLAG_HEADER != 0 {
        let message_id = elements.get(1).and_then(Value::as_str).map(MessageId::from);
        let header = read_blob(&mut cursor)
            .and_then(|blob| to_value(Field::Json, blob))
            .map_err(|reason| DecodeError {
                reason,
                message_type: Some(kind),
                message_id,
            })?;
        elements.push(header);
    }

    if (cursor.position() as usize) != bytes.len() {
        return Err(DecodeError {
            reason: DecodeFailure::Binary("trailing bytes".into()),
            message_type: Some(kind),
            message_id: elements.get(1).and_then(Value::as_str).map(MessageId::from),
        });
    }

    from_elements(elements, WireFormat::Binary)
}

fn truncated(kind: MessageType) -> DecodeError {
    DecodeError {
        reason: DecodeFailure::Binary("truncated frame".into()),
        message_type: Some(kind),
        message_id: None,
    }
}

fn write_blob(buf: &mut Vec<u8>, data: &[u8]) {
    // Writing into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(data.len() as u32);
    buf.extend_from_slice(data);
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, DecodeFailure> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| DecodeFailure::Binary("truncated length prefix".into()))?;
    if len > MAX_FIELD_LEN {
        return Err(DecodeFailure::Binary(format!("field of {} bytes exceeds limit", len)));
    }
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if u64::from(len) > remaining {
        return Err(DecodeFailure::Binary("truncated field".into()));
    }
    let mut data = vec![0u8; len as usize];
    cursor
        .read_exact(&mut data)
        .map_err(|_| DecodeFailure::Binary("truncated field".into()))?;
    Ok(data)
}

fn to_value(field: Field, blob: Vec<u8>) -> Result<Value, DecodeFailure> {
    match field {
        Field::Text => String::from_utf8(blob)
            .map(Value::String)
            .map_err(|_| DecodeFailure::Binary("text field is not UTF-8".into())),
        Field::Json => serde_json::from_slice(&blob).map_err(|e| DecodeFailure::Json(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Call, CallError, CallResult, ErrorCode, RoutingHeader};
    use crate::routing::{NetworkPath, SourceRouting};
    use crate::types::NodeId;
    use serde_json::json;

    #[test]
    fn test_binary_call_roundtrip() {
        let call = Call::new("DataTransfer", json!({"vendorId": "EK", "data": "x"}))
            .with_format(WireFormat::Binary)
            .with_header(RoutingHeader::new(
                SourceRouting::to(NodeId::from("CSMS")),
                NetworkPath::from_origin(NodeId::from("CS001")),
            ));
        let frame = Frame::Call(call);

        let bytes = encode(&frame);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], FLAG_HEADER);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_binary_error_roundtrip() {
        let mut error = CallError::new(MessageId::from("7"), ErrorCode::SecurityError, "bad signature")
            .with_details(json!({"resultCode": "SignatureError"}));
        error.format = WireFormat::Binary;
        let frame = Frame::CallError(error);

        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_binary_result_without_header() {
        let mut result = CallResult::new(MessageId::from("1"), json!({"status": "Accepted"}));
        result.format = WireFormat::Binary;
        let frame = Frame::CallResult(result);

        let bytes = encode(&frame);
        assert_eq!(bytes[1], 0);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_truncated_frame_keeps_id() {
        let call = Call::new("Heartbeat", json!({})).with_format(WireFormat::Binary);
        let id = call.message_id.clone();
        let bytes = encode(&Frame::Call(call));

        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err.reason, DecodeFailure::Binary(_)));
        assert_eq!(err.answerable_call_id(), Some(&id));
    }

    #[test]
    fn test_length_prefix_beyond_input_rejected() {
        // Result frame whose id claims just under the field limit
        let bytes = [3, 0, 0x00, 0xff, 0xff, 0xff, b'1'];
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.reason, DecodeFailure::Binary("truncated field".into()));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Frame::CallResult(CallResult {
            format: WireFormat::Binary,
            ..CallResult::new(MessageId::from("1"), json!({}))
        });
        let mut bytes = encode(&frame);
        bytes.push(0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_binary_type() {
        let err = decode(&[9, 0]).unwrap_err();
        assert_eq!(err.reason, DecodeFailure::UnknownMessageType(9));
        assert!(decode(&[]).is_err());
    }
}
