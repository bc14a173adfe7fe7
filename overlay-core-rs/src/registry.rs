//! Action → handler registry
//!
//! Populated once at startup and frozen inside the node. Each action has one
//! payload parser (from its [`OcppRequest`] plug-in) and one or more
//! handlers; the first handler that returns `Some` answers the Call.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::outcome::Outcome;
use crate::routing::NetworkPath;
use crate::signature::SignatureState;
use crate::types::{ConnectionId, EventTrackingId, MessageId};

/// Error returned by application handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Payload plug-in for one OCPP action
pub trait OcppRequest: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ACTION: &'static str;

    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn try_parse(document: &Value) -> Result<Self, String> {
        serde_json::from_value(document.clone()).map_err(|e| e.to_string())
    }

    fn to_document(response: &Self::Response) -> Result<Value, String> {
        serde_json::to_value(response).map_err(|e| e.to_string())
    }

    fn parse_response(document: &Value) -> Result<Self::Response, String> {
        serde_json::from_value(document.clone()).map_err(|e| e.to_string())
    }

    fn request_document(&self) -> Result<Value, String> {
        serde_json::to_value(self).map_err(|e| e.to_string())
    }
}

/// What a handler knows about the Call it answers
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
    pub network_path: NetworkPath,
    pub event_tracking_id: Option<EventTrackingId>,
    pub signature: SignatureState,
}

type Parsed = Arc<dyn Any + Send + Sync>;
type ParseFn = Box<dyn Fn(&Value) -> Result<Parsed, String> + Send + Sync>;
type HandlerFn = Box<
    dyn Fn(RequestContext, Parsed) -> BoxFuture<'static, Result<Option<Value>, HandlerError>>
        + Send
        + Sync,
>;

struct ActionEntry {
    parse: ParseFn,
    handlers: Vec<HandlerFn>,
}

/// A Call payload that passed its action's parser
pub struct ParsedRequest {
    action: String,
    value: Parsed,
}

/// Action name → parser and handlers
#[derive(Default)]
pub struct HandlerRegistry {
    actions: HashMap<String, ActionEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `R::ACTION`
    pub fn register<R, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        R: OcppRequest,
        F: Fn(RequestContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R::Response>, HandlerError>> + Send + 'static,
    {
        let entry = self.actions.entry(R::ACTION.to_string()).or_insert_with(|| ActionEntry {
            parse: Box::new(|doc: &Value| R::try_parse(doc).map(|r| Arc::new(r) as Parsed)),
            handlers: Vec::new(),
        });

        entry.handlers.push(Box::new(
            move |ctx: RequestContext, parsed: Parsed| -> BoxFuture<'static, Result<Option<Value>, HandlerError>> {
                match parsed.downcast::<R>() {
                    Ok(request) => encode_response::<R, _>(handler(ctx, (*request).clone())).boxed(),
                    Err(_) => mismatch().boxed(),
                }
            },
        ));
        debug!("Registered handler for {}", R::ACTION);
        self
    }

    /// Register a handler working on the raw payload document. The payload
    /// must be a JSON object; any object is accepted.
    pub fn register_raw<F, Fut>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        let action = action.into();
        let entry = self.actions.entry(action.clone()).or_insert_with(|| ActionEntry {
            parse: Box::new(|doc: &Value| {
                if doc.is_object() {
                    Ok(Arc::new(doc.clone()) as Parsed)
                } else {
                    Err("payload is not an object".to_string())
                }
            }),
            handlers: Vec::new(),
        });

        entry.handlers.push(Box::new(
            move |ctx: RequestContext, parsed: Parsed| -> BoxFuture<'static, Result<Option<Value>, HandlerError>> {
                match parsed.downcast_ref::<Value>() {
                    Some(document) => handler(ctx, document.clone()).boxed(),
                    None => mismatch().boxed(),
                }
            },
        ));
        debug!("Registered raw handler for {}", action);
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Run the action's payload parser. `None` when the action has no
    /// handler at all.
    pub fn parse(&self, action: &str, payload: &Value) -> Option<Result<ParsedRequest, String>> {
        let entry = self.actions.get(action)?;
        Some((entry.parse)(payload).map(|value| ParsedRequest {
            action: action.to_string(),
            value,
        }))
    }

    /// Invoke the handlers in registration order until one produces a
    /// response. Errors and panics become `ExceptionOccurred`.
    pub async fn invoke(&self, ctx: RequestContext, request: ParsedRequest) -> Outcome {
        let Some(entry) = self.actions.get(&request.action) else {
            return Outcome::no_handler(&request.action);
        };

        for (index, handler) in entry.handlers.iter().enumerate() {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler(ctx.clone(), request.value.clone())
            }));
            let result = match call {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            match result {
                Ok(Ok(Some(payload))) => return Outcome::success(payload),
                Ok(Ok(None)) => debug!("Handler {} for {} declined", index, request.action),
                Ok(Err(e)) => {
                    warn!("Handler for {} failed: {}", request.action, e);
                    return Outcome::exception(e.to_string());
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("Handler for {} panicked: {}", request.action, message);
                    return Outcome::exception(message);
                }
            }
        }

        Outcome::failed(format!("no handler produced a response for {}", request.action))
    }
}

async fn encode_response<R, Fut>(fut: Fut) -> Result<Option<Value>, HandlerError>
where
    R: OcppRequest,
    Fut: Future<Output = Result<Option<R::Response>, HandlerError>>,
{
    match fut.await? {
        Some(response) => Ok(Some(R::to_document(&response)?)),
        None => Ok(None),
    }
}

async fn mismatch() -> Result<Option<Value>, HandlerError> {
    Err("request type mismatch".into())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic in handler: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic in handler: {s}")
    } else {
        "panic in handler".to_string()
    }
}
