//! Result taxonomy of the dispatch pipeline
//!
//! Every decoded Call ends in exactly one [`Outcome`]. Failures travel as
//! CallErrors whose `errorDetails.resultCode` names the category, so a
//! caller several hops away can still tell a handler fault from a missing
//! handler.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;

use crate::codec::{CallError, CallResult, ErrorCode};
use crate::correlation::CorrelationError;
use crate::routing::RoutingError;
use crate::signature::{Signature, SigningError, VerificationFailure};
use crate::transport::TransportError;
use crate::types::MessageId;

/// Key inside `errorDetails` carrying the category
pub const RESULT_CODE_KEY: &str = "resultCode";

/// Response categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    RequestError,
    FormationViolation,
    SignatureError,
    Failed,
    ExceptionOccurred,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::RequestError => "RequestError",
            ResultCode::FormationViolation => "FormationViolation",
            ResultCode::SignatureError => "SignatureError",
            ResultCode::Failed => "Failed",
            ResultCode::ExceptionOccurred => "ExceptionOccurred",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(ResultCode::Success),
            "RequestError" => Ok(ResultCode::RequestError),
            "FormationViolation" => Ok(ResultCode::FormationViolation),
            "SignatureError" => Ok(ResultCode::SignatureError),
            "Failed" => Ok(ResultCode::Failed),
            "ExceptionOccurred" => Ok(ResultCode::ExceptionOccurred),
            _ => Err(()),
        }
    }
}

/// Error reported by a peer in a CallError
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl RemoteError {
    /// Category set by the node that built the error; peers that do not
    /// set one are treated as plain request errors
    pub fn classification(&self) -> ResultCode {
        self.details
            .get(RESULT_CODE_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ResultCode::RequestError)
    }
}

impl From<&CallError> for RemoteError {
    fn from(error: &CallError) -> Self {
        Self {
            code: error.error_code,
            description: error.error_description.clone(),
            details: error.error_details.clone(),
        }
    }
}

impl From<CallError> for RemoteError {
    fn from(error: CallError) -> Self {
        Self {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.classification(), self.description)
    }
}

/// Result of dispatching one Call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        payload: Value,
        /// Signatures already on the payload (relayed responses)
        signatures: Vec<Signature>,
    },
    RequestError(RemoteError),
    FormationViolation { reason: String },
    SignatureError { reason: String },
    Failed { code: ErrorCode, reason: String },
    ExceptionOccurred { reason: String },
}

impl Outcome {
    pub fn success(payload: Value) -> Self {
        Outcome::Success {
            payload,
            signatures: Vec::new(),
        }
    }

    /// Success carrying a peer's signed payload unchanged
    pub fn relayed(result: CallResult) -> Self {
        Outcome::Success {
            payload: result.payload,
            signatures: result.signatures,
        }
    }

    pub fn request_error(error: RemoteError) -> Self {
        Outcome::RequestError(error)
    }

    pub fn formation_violation(reason: impl Into<String>) -> Self {
        Outcome::FormationViolation { reason: reason.into() }
    }

    pub fn signature_error(failure: &VerificationFailure) -> Self {
        Outcome::SignatureError {
            reason: failure.to_string(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            code: ErrorCode::GenericError,
            reason: reason.into(),
        }
    }

    /// No handler is registered for `action`
    pub fn no_handler(action: &str) -> Self {
        Outcome::Failed {
            code: ErrorCode::NotImplemented,
            reason: format!("no handler registered for action {}", action),
        }
    }

    pub fn exception(reason: impl Into<String>) -> Self {
        Outcome::ExceptionOccurred { reason: reason.into() }
    }

    pub fn category(&self) -> ResultCode {
        match self {
            Outcome::Success { .. } => ResultCode::Success,
            Outcome::RequestError(_) => ResultCode::RequestError,
            Outcome::FormationViolation { .. } => ResultCode::FormationViolation,
            Outcome::SignatureError { .. } => ResultCode::SignatureError,
            Outcome::Failed { .. } => ResultCode::Failed,
            Outcome::ExceptionOccurred { .. } => ResultCode::ExceptionOccurred,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Wire form answering `message_id`
    pub fn into_response(self, message_id: MessageId) -> Response {
        let category = self.category();
        let (code, reason) = match self {
            Outcome::Success { payload, signatures } => {
                let mut result = CallResult::new(message_id, payload);
                result.signatures = signatures;
                return Response::Result(result);
            }
            Outcome::RequestError(remote) => {
                return Response::Error(
                    CallError::new(message_id, remote.code, remote.description).with_details(remote.details),
                );
            }
            Outcome::FormationViolation { reason } => (ErrorCode::FormatViolation, reason),
            Outcome::SignatureError { reason } => (ErrorCode::SecurityError, reason),
            Outcome::Failed { code, reason } => (code, reason),
            Outcome::ExceptionOccurred { reason } => (ErrorCode::InternalError, reason),
        };

        let details = json!({ RESULT_CODE_KEY: category.as_str() });
        Response::Error(CallError::new(message_id, code, reason).with_details(details))
    }
}

/// A response ready for signing and routing
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(CallResult),
    Error(CallError),
}

/// Why an outbound request did not produce a usable result
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("response signature rejected: {reason}")]
    Signature {
        reason: VerificationFailure,
        /// Payload as received, for diagnosis only
        payload: Value,
    },

    #[error("request timed out")]
    Timeout,

    #[error("connection lost before a response arrived")]
    ConnectionLost,

    #[error("invalid request payload: {0}")]
    InvalidRequest(String),

    #[error("invalid response payload: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallFailure {
    /// Category the caller should attribute this failure to
    pub fn classification(&self) -> ResultCode {
        match self {
            CallFailure::Remote(remote) => remote.classification(),
            CallFailure::Signature { .. } => ResultCode::SignatureError,
            CallFailure::InvalidRequest(_) | CallFailure::InvalidResponse(_) => ResultCode::FormationViolation,
            _ => ResultCode::Failed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallFailure::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_of(outcome: Outcome) -> CallError {
        match outcome.into_response(MessageId::from("42")) {
            Response::Error(e) => e,
            Response::Result(_) => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_wire_mapping() {
        let cases = [
            (Outcome::formation_violation("bad"), ErrorCode::FormatViolation, "FormationViolation"),
            (Outcome::SignatureError { reason: "x".into() }, ErrorCode::SecurityError, "SignatureError"),
            (Outcome::failed("nothing"), ErrorCode::GenericError, "Failed"),
            (Outcome::no_handler("Foo"), ErrorCode::NotImplemented, "Failed"),
            (Outcome::exception("boom"), ErrorCode::InternalError, "ExceptionOccurred"),
        ];
        for (outcome, code, category) in cases {
            let error = error_of(outcome);
            assert_eq!(error.message_id.as_str(), "42");
            assert_eq!(error.error_code, code);
            assert_eq!(error.error_details[RESULT_CODE_KEY], category);
        }
    }

    #[test]
    fn test_request_error_is_verbatim() {
        let remote = RemoteError {
            code: ErrorCode::InternalError,
            description: "handler panicked".into(),
            details: json!({"resultCode": "ExceptionOccurred", "hop": "Relay2"}),
        };
        let error = error_of(Outcome::request_error(remote.clone()));
        assert_eq!(error.error_code, ErrorCode::InternalError);
        assert_eq!(error.error_description, "handler panicked");
        assert_eq!(error.error_details, remote.details);
        assert_eq!(RemoteError::from(&error).classification(), ResultCode::ExceptionOccurred);
    }

    #[test]
    fn test_request_error_keeps_non_object_details() {
        let remote = RemoteError {
            code: ErrorCode::GenericError,
            description: "legacy peer".into(),
            details: json!("see log 17"),
        };
        let error = error_of(Outcome::request_error(remote));
        assert_eq!(error.error_details, json!("see log 17"));
    }

    #[test]
    fn test_unclassified_remote_error() {
        let remote = RemoteError {
            code: ErrorCode::NotSupported,
            description: String::new(),
            details: json!({}),
        };
        assert_eq!(remote.classification(), ResultCode::RequestError);
    }

    #[test]
    fn test_success_keeps_signatures() {
        let mut result = CallResult::new(MessageId::from("1"), json!({"status": "Accepted"}));
        result.signatures.push(Signature {
            key_id: "aa".into(),
            signing_method: "Ed25519-SHA256".into(),
            value: "bb".into(),
        });
        let outcome = Outcome::relayed(result.clone());
        assert_eq!(outcome.category(), ResultCode::Success);
        assert_eq!(outcome.into_response(MessageId::from("1")), Response::Result(result));
    }

    #[test]
    fn test_result_code_parsing() {
        for code in [
            ResultCode::Success,
            ResultCode::RequestError,
            ResultCode::FormationViolation,
            ResultCode::SignatureError,
            ResultCode::Failed,
            ResultCode::ExceptionOccurred,
        ] {
            assert_eq!(code.as_str().parse(), Ok(code));
        }
        assert!("Unknown".parse::<ResultCode>().is_err());
    }
}
