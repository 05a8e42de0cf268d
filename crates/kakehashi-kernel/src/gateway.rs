//! Callback gateway: guest code asking the host to do something.
//!
//! Each call gets the next correlation id, parks a oneshot sender in the
//! pending table, and writes a `call-request` line. The dispatcher hands
//! matching `call-response` lines to [`CallbackGateway::resolve`], which wakes
//! the waiter. Every pending entry is removed exactly once: on response, on
//! deadline expiry, on cancellation, or when its waiter is dropped.
//!
//! The deadline is fixed when the request is sent. Entries nobody waits on are
//! swept out by the next [`CallbackGateway::begin`] once they expire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use kakehashi_types::Outbound;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::outbox::Outbox;

/// Default deadline for one host call.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a host call did not produce a value.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallbackError {
    /// The host answered with an `error` field.
    #[error("{0}")]
    Host(String),

    #[error("host call {correlation_id} timed out after {after:?}")]
    TimedOut { correlation_id: u64, after: Duration },

    #[error("host call {correlation_id} cancelled: {reason}")]
    Cancelled { correlation_id: u64, reason: String },

    #[error("transport closed")]
    TransportClosed,
}

type Reply = Result<Value, CallbackError>;

struct PendingCall {
    tx: oneshot::Sender<Reply>,
    target: String,
    operation: String,
    deadline: Instant,
}

struct GatewayInner {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    outbox: Outbox,
    timeout: Duration,
}

/// Shared handle; clones refer to the same pending table and id sequence.
#[derive(Clone)]
pub struct CallbackGateway {
    inner: Arc<GatewayInner>,
}

impl CallbackGateway {
    pub fn new(outbox: Outbox, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                next_id: AtomicU64::new(0),
                pending: DashMap::new(),
                outbox,
                timeout,
            }),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of calls still waiting for the host.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a `call-request` and return a handle for its reply.
    ///
    /// The pending entry is recorded before the request is written, so a
    /// response can never race ahead of its own bookkeeping.
    pub fn begin(
        &self,
        target: impl Into<String>,
        operation: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<PendingReply, CallbackError> {
        let target = target.into();
        let operation = operation.into();
        let now = Instant::now();
        self.purge_expired(now);
        let deadline = deadline_after(now, self.inner.timeout);
        let correlation_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.inner.pending.insert(
            correlation_id,
            PendingCall {
                tx,
                target: target.clone(),
                operation: operation.clone(),
                deadline,
            },
        );

        debug!(correlation_id, %target, %operation, "host call");
        let sent = self.inner.outbox.send(Outbound::CallRequest {
            correlation_id,
            target,
            operation,
            args,
        });
        if !sent {
            self.inner.pending.remove(&correlation_id);
            return Err(CallbackError::TransportClosed);
        }

        Ok(PendingReply {
            correlation_id,
            rx: Some(rx),
            deadline,
            gateway: self.clone(),
        })
    }

    /// Call a host operation and wait for its answer (bounded by the gateway deadline).
    #[instrument(skip_all, name = "callback.call", fields(callback.target = %target, callback.operation = %operation))]
    pub async fn call(&self, target: &str, operation: &str, args: Vec<Value>) -> Reply {
        self.begin(target, operation, args)?.wait().await
    }

    /// Complete a pending call from a `call-response`.
    ///
    /// Returns false (and changes nothing) for unknown or already-settled ids.
    pub fn resolve(&self, correlation_id: u64, result: Option<Value>, error: Option<String>) -> bool {
        let Some((_, call)) = self.inner.pending.remove(&correlation_id) else {
            warn!(correlation_id, "response for unknown or settled host call");
            return false;
        };
        if call.deadline <= Instant::now() {
            warn!(correlation_id, "late response for expired host call");
            return false;
        }

        let reply = match error {
            Some(message) => Err(CallbackError::Host(message)),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        debug!(
            correlation_id,
            target = %call.target,
            operation = %call.operation,
            ok = reply.is_ok(),
            "host call settled"
        );
        // Waiter may already be gone; nothing to do then.
        let _ = call.tx.send(reply);
        true
    }

    /// Reject every pending call. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for correlation_id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&correlation_id) {
                let _ = call.tx.send(Err(CallbackError::Cancelled {
                    correlation_id,
                    reason: reason.to_string(),
                }));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(cancelled, reason, "cancelled pending host calls");
        }
        cancelled
    }

    /// Drop every entry whose deadline has passed. Their waiters see a timeout.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.inner.pending.len();
        self.inner.pending.retain(|_, call| call.deadline > now);
        let expired = before.saturating_sub(self.inner.pending.len());
        if expired > 0 {
            debug!(expired, "swept expired host calls");
        }
        expired
    }

    fn forget(&self, correlation_id: u64) {
        self.inner.pending.remove(&correlation_id);
    }
}

impl std::fmt::Debug for CallbackGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGateway")
            .field("next_id", &self.inner.next_id.load(Ordering::SeqCst))
            .field("pending", &self.inner.pending.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

/// The waiting half of one host call.
///
/// Dropping it without waiting abandons the call and frees its pending slot.
pub struct PendingReply {
    correlation_id: u64,
    rx: Option<oneshot::Receiver<Reply>>,
    deadline: Instant,
    gateway: CallbackGateway,
}

impl PendingReply {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait for the host, up to the deadline set when the request was sent.
    pub async fn wait(mut self) -> Reply {
        let correlation_id = self.correlation_id;
        let after = self.gateway.timeout();
        let Some(rx) = self.rx.take() else {
            return Err(CallbackError::Cancelled {
                correlation_id,
                reason: "reply already consumed".into(),
            });
        };

        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) if Instant::now() >= self.deadline => {
                warn!(correlation_id, ?after, "host call expired");
                Err(CallbackError::TimedOut {
                    correlation_id,
                    after,
                })
            }
            Ok(Err(_)) => Err(CallbackError::Cancelled {
                correlation_id,
                reason: "pending call dropped".into(),
            }),
            Err(_) => {
                self.gateway.forget(correlation_id);
                warn!(correlation_id, ?after, "host call timed out");
                Err(CallbackError::TimedOut {
                    correlation_id,
                    after,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.gateway.forget(self.correlation_id);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn gateway(timeout: Duration) -> (CallbackGateway, UnboundedReceiver<Outbound>) {
        let (outbox, rx) = Outbox::channel();
        (CallbackGateway::new(outbox, timeout), rx)
    }

    fn call_id(msg: Outbound) -> u64 {
        match msg {
            Outbound::CallRequest { correlation_id, .. } => correlation_id,
            other => panic!("expected call-request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_from_zero() {
        let (gw, mut rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let a = gw.begin("svc", "a", vec![]).unwrap();
        let b = gw.begin("svc", "b", vec![]).unwrap();
        assert_eq!(a.correlation_id(), 0);
        assert_eq!(b.correlation_id(), 1);
        assert_eq!(call_id(rx.recv().await.unwrap()), 0);
        assert_eq!(call_id(rx.recv().await.unwrap()), 1);
        assert_eq!(gw.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_call_request_carries_arguments() {
        let (gw, mut rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let _reply = gw.begin("math", "add", vec![json!(1), json!(2)]).unwrap();
        match rx.recv().await.unwrap() {
            Outbound::CallRequest {
                target,
                operation,
                args,
                ..
            } => {
                assert_eq!(target, "math");
                assert_eq!(operation, "add");
                assert_eq!(args, vec![json!(1), json!(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_with_result() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let reply = gw.begin("svc", "op", vec![]).unwrap();
        assert!(gw.resolve(0, Some(json!({"ok": true})), None));
        assert_eq!(reply.wait().await, Ok(json!({"ok": true})));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_without_result_is_null() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let reply = gw.begin("svc", "op", vec![]).unwrap();
        gw.resolve(0, None, None);
        assert_eq!(reply.wait().await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_resolve_with_error() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let reply = gw.begin("svc", "op", vec![]).unwrap();
        gw.resolve(0, Some(json!(1)), Some("no such target".into()));
        assert_eq!(
            reply.wait().await,
            Err(CallbackError::Host("no such target".into()))
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let _reply = gw.begin("svc", "op", vec![]).unwrap();
        assert!(!gw.resolve(42, Some(json!(1)), None));
        assert_eq!(gw.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let reply = gw.begin("svc", "op", vec![]).unwrap();
        assert!(gw.resolve(0, Some(json!(1)), None));
        assert!(!gw.resolve(0, Some(json!(2)), None));
        assert_eq!(reply.wait().await, Ok(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending() {
        let (gw, _rx) = gateway(Duration::from_secs(5));
        let result = gw.call("svc", "slow", vec![]).await;
        assert_eq!(
            result,
            Err(CallbackError::TimedOut {
                correlation_id: 0,
                after: Duration::from_secs(5)
            })
        );
        assert_eq!(gw.pending_count(), 0);
        // A late answer is just an unknown id now.
        assert!(!gw.resolve(0, Some(json!(1)), None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_at_send() {
        let (gw, _rx) = gateway(Duration::from_secs(5));
        let reply = gw.begin("svc", "slow", vec![]).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let start = Instant::now();
        assert!(matches!(
            reply.wait().await,
            Err(CallbackError::TimedOut { correlation_id: 0, .. })
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwaited_calls_expire() {
        let (gw, _rx) = gateway(Duration::from_secs(5));
        let stale = gw.begin("svc", "a", vec![]).unwrap();
        let _other = gw.begin("svc", "b", vec![]).unwrap();
        assert_eq!(gw.pending_count(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _fresh = gw.begin("svc", "c", vec![]).unwrap();
        assert_eq!(gw.pending_count(), 1);
        assert!(!gw.resolve(0, Some(json!(1)), None));
        assert!(matches!(
            stale.wait().await,
            Err(CallbackError::TimedOut { correlation_id: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_rejected() {
        let (gw, _rx) = gateway(Duration::from_secs(5));
        let _reply = gw.begin("svc", "op", vec![]).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!gw.resolve(0, Some(json!(1)), None));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let a = gw.begin("svc", "a", vec![]).unwrap();
        let b = gw.begin("svc", "b", vec![]).unwrap();
        assert_eq!(gw.cancel_all("shutting down"), 2);
        assert!(matches!(
            a.wait().await,
            Err(CallbackError::Cancelled { correlation_id: 0, .. })
        ));
        assert!(matches!(
            b.wait().await,
            Err(CallbackError::Cancelled { correlation_id: 1, .. })
        ));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_reply_frees_slot() {
        let (gw, _rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        let reply = gw.begin("svc", "op", vec![]).unwrap();
        assert_eq!(gw.pending_count(), 1);
        drop(reply);
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let (gw, rx) = gateway(DEFAULT_CALLBACK_TIMEOUT);
        drop(rx);
        assert_eq!(
            gw.call("svc", "op", vec![]).await,
            Err(CallbackError::TransportClosed)
        );
        assert_eq!(gw.pending_count(), 0);
    }
}
