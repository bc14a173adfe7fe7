//! Observability hooks
//!
//! The node awaits every notification before it moves on, so tests observe
//! a deterministic sequence. A failing or panicking observer is logged and
//! otherwise ignored.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{info, warn};

use crate::outcome::{RemoteError, ResultCode};
use crate::routing::NetworkPath;
use crate::signature::SignatureState;
use crate::types::{ConnectionId, EventTrackingId, MessageId};

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// A Call passed parsing and verification and is about to be handled
#[derive(Debug, Clone)]
pub struct RequestReceived {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
    pub network_path: NetworkPath,
    pub event_tracking_id: Option<EventTrackingId>,
    pub signature: SignatureState,
}

/// A response was handed to the transport
#[derive(Debug, Clone)]
pub struct ResponseSent {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
    pub result: ResultCode,
    /// Outcome of the send attempt
    pub send_result: Result<(), String>,
}

/// A CallError answered one of our requests
#[derive(Debug, Clone)]
pub struct ErrorReceived {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
    pub error: RemoteError,
}

/// We sent a Call
#[derive(Debug, Clone)]
pub struct RequestSent {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
}

/// A CallResult answered one of our requests
#[derive(Debug, Clone)]
pub struct ResponseReceived {
    pub connection: ConnectionId,
    pub message_id: MessageId,
    pub action: String,
    pub signature: SignatureState,
}

#[async_trait]
pub trait Observer: Send + Sync {
    async fn request_received(&self, _event: &RequestReceived) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn response_sent(&self, _event: &ResponseSent) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn error_received(&self, _event: &ErrorReceived) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn request_sent(&self, _event: &RequestSent) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn response_received(&self, _event: &ResponseReceived) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Emits every notification as a tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

#[async_trait]
impl Observer for TracingObserver {
    async fn request_received(&self, event: &RequestReceived) -> Result<(), ObserverError> {
        info!(
            connection = %event.connection,
            message_id = %event.message_id,
            action = %event.action,
            path = ?event.network_path.hops(),
            "request received"
        );
        Ok(())
    }

    async fn response_sent(&self, event: &ResponseSent) -> Result<(), ObserverError> {
        match &event.send_result {
            Ok(()) => info!(
                connection = %event.connection,
                message_id = %event.message_id,
                action = %event.action,
                result = %event.result,
                "response sent"
            ),
            Err(e) => warn!(
                connection = %event.connection,
                message_id = %event.message_id,
                action = %event.action,
                result = %event.result,
                error = %e,
                "response send failed"
            ),
        }
        Ok(())
    }

    async fn error_received(&self, event: &ErrorReceived) -> Result<(), ObserverError> {
        warn!(
            connection = %event.connection,
            message_id = %event.message_id,
            action = %event.action,
            code = %event.error.code,
            classification = %event.error.classification(),
            "error received: {}",
            event.error.description
        );
        Ok(())
    }
}

/// Run a notification, swallowing its failures
pub(crate) async fn notify<F>(hook: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<(), ObserverError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Observer {} failed: {}", hook, e),
        Err(_) => warn!("Observer {} panicked", hook),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Observer for Failing {
        async fn request_sent(&self, _event: &RequestSent) -> Result<(), ObserverError> {
            Err("sink unavailable".into())
        }

        async fn response_received(&self, _event: &ResponseReceived) -> Result<(), ObserverError> {
            panic!("observer bug")
        }
    }

    #[tokio::test]
    async fn test_observer_faults_are_contained() {
        let observer = Failing;
        let sent = RequestSent {
            connection: ConnectionId(1),
            message_id: MessageId::from("1"),
            action: "Heartbeat".into(),
        };
        notify("request_sent", observer.request_sent(&sent)).await;

        let received = ResponseReceived {
            connection: ConnectionId(1),
            message_id: MessageId::from("1"),
            action: "Heartbeat".into(),
            signature: SignatureState::Unsigned,
        };
        notify("response_received", observer.response_received(&received)).await;
    }

    #[tokio::test]
    async fn test_tracing_observer_accepts_everything() {
        let event = ResponseSent {
            connection: ConnectionId(1),
            message_id: MessageId::from("1"),
            action: "Heartbeat".into(),
            result: ResultCode::Success,
            send_result: Err("closed".into()),
        };
        tokio_test::assert_ok!(TracingObserver.response_sent(&event).await);
    }
}
