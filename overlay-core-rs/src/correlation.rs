//! Request/response correlation
//!
//! Each outbound Call gets one entry keyed by `(connection, message id)`.
//! Whoever removes the entry first (response, error, expiry, connection
//! loss or cancellation) decides the outcome; everything after that is a
//! no-op. The receiving half of the entry is a [`PendingHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{CallError, CallResult};
use crate::signature::VerificationFailure;
use crate::types::{ConnectionId, MessageId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("message id {message_id} already in flight on {connection}")]
    Duplicate {
        connection: ConnectionId,
        message_id: MessageId,
    },
}

/// Terminal state of a pending request
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Resolved(CallResult),
    Rejected(CallError),
    /// A CallResult arrived but failed signature verification
    SignatureInvalid {
        result: CallResult,
        reason: VerificationFailure,
    },
    TimedOut,
    ConnectionLost,
}

type Key = (ConnectionId, MessageId);

struct PendingEntry {
    token: u64,
    action: String,
    deadline: Instant,
    tx: oneshot::Sender<ResponseOutcome>,
}

/// Right to complete one pending request, obtained by removing its entry
pub struct Completion {
    action: String,
    tx: oneshot::Sender<ResponseOutcome>,
}

impl Completion {
    /// Action of the Call being answered
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Deliver the outcome; false if the caller stopped waiting
    pub fn complete(self, outcome: ResponseOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Table of in-flight requests, shared by every connection
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<Key, PendingEntry>>>,
    tokens: Arc<AtomicU64>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a Call about to be sent on `connection`
    pub fn register(
        &self,
        connection: ConnectionId,
        message_id: MessageId,
        action: &str,
        timeout: Duration,
    ) -> Result<PendingHandle, CorrelationError> {
        let key = (connection, message_id);
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(CorrelationError::Duplicate {
                connection: key.0,
                message_id: key.1,
            });
        }

        let (tx, rx) = oneshot::channel();
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        entries.insert(
            key.clone(),
            PendingEntry {
                token,
                action: action.to_string(),
                deadline,
                tx,
            },
        );
        drop(entries);

        debug!("Pending {} {} on {}", action, key.1, key.0);
        Ok(PendingHandle {
            table: self.clone(),
            key,
            token,
            deadline,
            rx,
        })
    }

    /// Remove the entry answered by an inbound response
    pub fn take(&self, connection: ConnectionId, message_id: &MessageId) -> Option<Completion> {
        let entry = self.entries.lock().remove(&(connection, message_id.clone()));
        match entry {
            Some(entry) => Some(Completion {
                action: entry.action,
                tx: entry.tx,
            }),
            None => {
                warn!("Discarding response for unknown message id {} on {}", message_id, connection);
                None
            }
        }
    }

    /// Complete with a CallResult; false if no entry was waiting
    pub fn resolve(&self, connection: ConnectionId, result: CallResult) -> bool {
        match self.take(connection, &result.message_id) {
            Some(completion) => {
                completion.complete(ResponseOutcome::Resolved(result));
                true
            }
            None => false,
        }
    }

    /// Complete with a CallError; false if no entry was waiting
    pub fn reject(&self, connection: ConnectionId, error: CallError) -> bool {
        match self.take(connection, &error.message_id) {
            Some(completion) => {
                completion.complete(ResponseOutcome::Rejected(error));
                true
            }
            None => false,
        }
    }

    /// Time out every entry whose deadline is at or before `now`
    pub fn expire(&self, now: Instant) -> Vec<(ConnectionId, MessageId)> {
        let expired: Vec<(Key, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<Key> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(key, entry)| {
                debug!("Request {} {} timed out", entry.action, key.1);
                let _ = entry.tx.send(ResponseOutcome::TimedOut);
                key
            })
            .collect()
    }

    /// Fail every request waiting on a lost connection
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let lost: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<Key> = entries.keys().filter(|k| k.0 == connection).cloned().collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        let count = lost.len();
        for entry in lost {
            let _ = entry.tx.send(ResponseOutcome::ConnectionLost);
        }
        if count > 0 {
            warn!("{} pending requests lost with {}", count, connection);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, connection: ConnectionId, message_id: &MessageId) -> bool {
        self.entries.lock().contains_key(&(connection, message_id.clone()))
    }

    /// Run [`expire`](Self::expire) every `interval`
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = table.expire(Instant::now());
                if !expired.is_empty() {
                    debug!("Sweeper expired {} requests", expired.len());
                }
            }
        })
    }

    /// Remove one specific registration, leaving any newer entry with the
    /// same key alone
    fn remove_if_current(&self, key: &Key, token: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Caller side of a pending request
pub struct PendingHandle {
    table: PendingRequests,
    key: Key,
    token: u64,
    deadline: Instant,
    rx: oneshot::Receiver<ResponseOutcome>,
}

impl PendingHandle {
    pub fn message_id(&self) -> &MessageId {
        &self.key.1
    }

    pub fn connection(&self) -> ConnectionId {
        self.key.0
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the terminal outcome. The deadline is enforced here as well
    /// as by the sweeper, so this never hangs. Dropping the future before it
    /// completes unregisters the request.
    pub async fn wait(mut self) -> ResponseOutcome {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ResponseOutcome::ConnectionLost,
            Err(_) => {
                if self.table.remove_if_current(&self.key, self.token) {
                    debug!("Request {} timed out", self.key.1);
                    return ResponseOutcome::TimedOut;
                }
                // Someone else removed the entry first and owns the outcome
                (&mut self.rx).await.unwrap_or(ResponseOutcome::ConnectionLost)
            }
        }
    }

    /// Stop waiting. Returns the outcome instead if one was already
    /// decided; the request on the wire is not retracted.
    pub async fn cancel(mut self) -> Option<ResponseOutcome> {
        if self.table.remove_if_current(&self.key, self.token) {
            debug!("Request {} cancelled", self.key.1);
            return None;
        }
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        // No-op once an outcome was decided: the entry is already gone
        self.table.remove_if_current(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ErrorCode;
    use serde_json::json;

    const CONN: ConnectionId = ConnectionId(1);

    fn result(id: &str) -> CallResult {
        CallResult::new(MessageId::from(id), json!({"status": "Accepted"}))
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();

        assert!(table.resolve(CONN, result("1")));
        assert_eq!(handle.wait().await, ResponseOutcome::Resolved(result("1")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_wakes_waiter() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Reset", Duration::from_secs(5))
            .unwrap();
        let error = CallError::new(MessageId::from("1"), ErrorCode::NotSupported, "no");

        assert!(table.reject(CONN, error.clone()));
        assert_eq!(handle.wait().await, ResponseOutcome::Rejected(error));
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_responses_are_discarded() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();

        assert!(!table.resolve(CONN, result("2")));
        assert!(!table.resolve(ConnectionId(2), result("1")));
        assert!(table.resolve(CONN, result("1")));
        assert!(!table.resolve(CONN, result("1")));
        assert!(matches!(handle.wait().await, ResponseOutcome::Resolved(_)));
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let table = PendingRequests::new();
        let _first = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();
        let second = table.register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5));
        assert!(matches!(second, Err(CorrelationError::Duplicate { .. })));

        // Same id on another connection is independent
        assert!(table
            .register(ConnectionId(2), MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_sweeper() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(30))
            .unwrap();

        assert_eq!(handle.wait().await, ResponseOutcome::TimedOut);
        assert!(table.is_empty());
        assert!(!table.resolve(CONN, result("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_overdue() {
        let table = PendingRequests::new();
        let short = table
            .register(CONN, MessageId::from("short"), "Heartbeat", Duration::from_secs(1))
            .unwrap();
        let _long = table
            .register(CONN, MessageId::from("long"), "Heartbeat", Duration::from_secs(60))
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = table.expire(Instant::now());
        assert_eq!(expired, vec![(CONN, MessageId::from("short"))]);
        assert_eq!(short.wait().await, ResponseOutcome::TimedOut);
        assert!(table.contains(CONN, &MessageId::from("long")));
    }

    #[tokio::test]
    async fn test_connection_loss() {
        let table = PendingRequests::new();
        let a = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();
        let b = table
            .register(ConnectionId(2), MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();

        assert_eq!(table.fail_connection(CONN), 1);
        assert_eq!(a.wait().await, ResponseOutcome::ConnectionLost);
        assert!(table.resolve(ConnectionId(2), result("1")));
        assert!(matches!(b.wait().await, ResponseOutcome::Resolved(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_late_response() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();

        assert_eq!(handle.cancel().await, None);
        assert!(!table.resolve(CONN, result("1")));
    }

    #[tokio::test]
    async fn test_cancel_after_resolution_reports_outcome() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();

        table.resolve(CONN, result("1"));
        assert_eq!(handle.cancel().await, Some(ResponseOutcome::Resolved(result("1"))));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_remove_reused_id() {
        let table = PendingRequests::new();
        let old = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();
        table.resolve(CONN, result("1"));

        let _new = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(5))
            .unwrap();
        drop(old);
        assert!(table.contains(CONN, &MessageId::from("1")));
    }

    #[tokio::test]
    async fn test_aborted_waiter_unregisters() {
        let table = PendingRequests::new();
        let handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(3600))
            .unwrap();

        let waiter = tokio::spawn(handle.wait());
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert!(table.is_empty());
        assert!(!table.resolve(CONN, result("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_entries() {
        let table = PendingRequests::new();
        let _handle = table
            .register(CONN, MessageId::from("1"), "Heartbeat", Duration::from_secs(1))
            .unwrap();
        let sweeper = table.spawn_sweeper(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(table.is_empty());
        sweeper.abort();
    }
}
