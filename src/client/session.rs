//! Request/response correlation over the duplicated-response wire quirk.
//!
//! Every `sendMessage` RPC produces two inbound frames with the same
//! `request_id`: an acknowledgment (`name == "result"`) followed by the data
//! response. Resolution is keyed strictly by identifier, never by arrival
//! order or name, so interleaved responses cannot cross-resolve; the
//! acknowledgment is discarded before identifier matching, so a data frame
//! arriving first still resolves and a stray later ACK is a no-op.

use crate::client::transport::FrameSink;
use crate::client::wire::{self, Frame, MSG_SEND, MSG_SUBSCRIBE, MSG_UNSUBSCRIBE};
use crate::error::{BlitzError, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default deadline for a correlated call. Timeout is terminal for that call
/// only; there is no retry.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Optional response-shape check. A failure is logged as a warning and the
/// call still resolves with the raw payload (fail-open).
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Listener for push frames that did not resolve a pending request.
pub type PushHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

struct Pending {
    tx: oneshot::Sender<Frame>,
    validator: Option<Validator>,
}

/// Protocol session: monotonic request identifiers, a pending-request table
/// resolved exactly once per identifier, and push listener tables for frames
/// that belong to no request.
pub struct Session {
    sink: Arc<dyn FrameSink>,
    next_id: AtomicU64,
    pending: DashMap<String, Pending>,
    handlers: RwLock<HashMap<String, Vec<PushHandler>>>,
    any_handlers: RwLock<Vec<PushHandler>>,
    timeout: Duration,
}

impl Session {
    pub fn new(sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Self::with_timeout(sink, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(sink: Arc<dyn FrameSink>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            any_handlers: RwLock::new(Vec::new()),
            timeout,
        })
    }

    /// Wire this session into a transport: every inbound frame goes through
    /// `handle_frame`, and a dropped connection fails all outstanding
    /// requests immediately instead of leaving them to time out.
    pub fn bind(self: &Arc<Self>, transport: &super::transport::WsTransport) {
        let session = Arc::clone(self);
        transport.on_any(move |frame| session.handle_frame(frame.clone()));

        let session = Arc::clone(self);
        transport.on_disconnect(move || session.fail_all_pending());
    }

    fn next_request_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Last server clock value observed by the transport, in seconds.
    pub fn server_time_secs(&self) -> Option<u64> {
        self.sink.server_time_ms().map(|ms| ms / 1000)
    }

    /// Number of requests currently awaiting a data response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Inner RPC wrapped in the `sendMessage` envelope, resolved by the next
    /// non-acknowledgment frame bearing the same identifier.
    pub async fn call(&self, inner_name: &str, version: &str, body: Value) -> Result<Frame> {
        self.call_with(inner_name, version, body, None).await
    }

    /// `call` with an optional response-shape validator (fail-open).
    pub async fn call_with(
        &self,
        inner_name: &str,
        version: &str,
        body: Value,
        validator: Option<Validator>,
    ) -> Result<Frame> {
        let request_id = self.next_request_id();
        let frame = Frame {
            name: MSG_SEND.to_string(),
            request_id: Some(request_id.clone()),
            msg: json!({ "name": inner_name, "version": version, "body": body }),
            local_time: Some(self.sink.local_time_ms()),
            status: None,
        };

        let rx = self.register_pending(&request_id, validator);
        if let Err(err) = self.sink.send_frame(&frame).await {
            self.pending.remove(&request_id);
            return Err(err);
        }
        self.wait(inner_name, request_id, rx).await
    }

    /// Top-level call without the inner-RPC wrapping. With
    /// `expect_response = false` the frame is transmitted and no pending
    /// entry is registered.
    pub async fn send(&self, name: &str, msg: Value, expect_response: bool) -> Result<Option<Frame>> {
        let request_id = self.next_request_id();
        let frame = Frame {
            name: name.to_string(),
            request_id: Some(request_id.clone()),
            msg,
            local_time: None,
            status: None,
        };

        if !expect_response {
            self.sink.send_frame(&frame).await?;
            return Ok(None);
        }

        let rx = self.register_pending(&request_id, None);
        if let Err(err) = self.sink.send_frame(&frame).await {
            self.pending.remove(&request_id);
            return Err(err);
        }
        self.wait(name, request_id, rx).await.map(Some)
    }

    /// Fire-and-forget: no identifier, no pending entry, no resolution ever.
    pub async fn fire(&self, name: &str, msg: Value) -> Result<()> {
        self.sink.send_frame(&Frame::named(name, msg)).await
    }

    /// Subscribe to a server push stream. No pending entry is registered; a
    /// subscription acknowledgment, if any, is not correlated.
    pub async fn subscribe(
        &self,
        name: &str,
        version: Option<&str>,
        routing_filters: Option<Value>,
    ) -> Result<()> {
        let body = wire::subscription_body(name, version, routing_filters);
        self.sink.send_frame(&Frame::named(MSG_SUBSCRIBE, body)).await
    }

    /// Tear down a server push stream. Same envelope shape as subscribe.
    pub async fn unsubscribe(
        &self,
        name: &str,
        version: Option<&str>,
        routing_filters: Option<Value>,
    ) -> Result<()> {
        let body = wire::subscription_body(name, version, routing_filters);
        self.sink.send_frame(&Frame::named(MSG_UNSUBSCRIBE, body)).await
    }

    /// Register a listener for push frames with a specific name.
    pub fn on(&self, name: impl Into<String>, handler: impl Fn(&Frame) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap()
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a listener for every push frame regardless of name.
    pub fn on_any(&self, handler: impl Fn(&Frame) + Send + Sync + 'static) {
        self.any_handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Dispatch one inbound frame.
    ///
    /// Acknowledgment frames are discarded without touching the pending
    /// table. A frame whose identifier matches a pending entry removes and
    /// resolves that entry exactly once. Everything else is forwarded to the
    /// push listeners.
    pub fn handle_frame(&self, frame: Frame) {
        if frame.is_ack() {
            return;
        }

        if let Some(request_id) = frame.request_id.as_deref() {
            if let Some((_, pending)) = self.pending.remove(request_id) {
                if let Some(validate) = pending.validator {
                    if let Err(reason) = validate(&frame.msg) {
                        warn!(
                            name = %frame.name,
                            request_id,
                            %reason,
                            "response failed shape validation, resolving with raw payload"
                        );
                    }
                }
                // Receiver may already be gone if the caller timed out
                // between removal and delivery.
                let _ = pending.tx.send(frame);
                return;
            }
        }

        self.notify_push(&frame);
    }

    /// Fail every outstanding request with `ConnectionLost`. Called by the
    /// transport disconnect hook.
    pub fn fail_all_pending(&self) {
        let outstanding = self.pending.len();
        self.pending.clear();
        if outstanding > 0 {
            warn!(count = outstanding, "failing outstanding requests after connection loss");
        }
    }

    fn register_pending(&self, request_id: &str, validator: Option<Validator>) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), Pending { tx, validator });
        rx
    }

    async fn wait(&self, name: &str, request_id: String, rx: oneshot::Receiver<Frame>) -> Result<Frame> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Pending entry was dropped without resolution: transport loss.
            Ok(Err(_)) => Err(BlitzError::ConnectionLost),
            Err(_) => {
                self.pending.remove(&request_id);
                debug!(name, request_id, "request timed out");
                Err(BlitzError::RequestTimeout {
                    name: name.to_string(),
                    request_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    fn notify_push(&self, frame: &Frame) {
        let named: Vec<PushHandler> = self
            .handlers
            .read()
            .unwrap()
            .get(&frame.name)
            .cloned()
            .unwrap_or_default();
        for handler in named {
            handler(frame);
        }

        let global: Vec<PushHandler> = self.any_handlers.read().unwrap().clone();
        for handler in global {
            handler(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{ack, data, push, MockSink};
    use std::sync::Mutex;
    use tokio::task::yield_now;

    fn session(sink: &Arc<MockSink>) -> Arc<Session> {
        Session::new(Arc::clone(sink) as Arc<dyn FrameSink>)
    }

    /// Spawn a call and poll until its outbound frame hits the sink, so the
    /// pending entry is guaranteed to be registered.
    async fn spawn_call(
        session: &Arc<Session>,
        sink: &Arc<MockSink>,
        inner_name: &'static str,
    ) -> tokio::task::JoinHandle<Result<Frame>> {
        let before = sink.sent_count();
        let task_session = Arc::clone(session);
        let handle =
            tokio::spawn(async move { task_session.call(inner_name, "1.0", json!({})).await });
        while sink.sent_count() == before {
            yield_now().await;
        }
        handle
    }

    #[tokio::test]
    async fn ack_then_data_resolves_with_data() {
        let sink = MockSink::new();
        let session = session(&sink);

        let call = spawn_call(&session, &sink, "core.get-profile").await;
        session.handle_frame(ack("1"));
        assert_eq!(session.pending_count(), 1, "ACK must not resolve the call");
        session.handle_frame(data("1", "profile", json!({"value": 42})));

        let frame = call.await.unwrap().unwrap();
        assert_eq!(frame.name, "profile");
        assert_eq!(frame.msg, json!({"value": 42}));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn data_frame_before_ack_resolves() {
        let sink = MockSink::new();
        let session = session(&sink);

        let call = spawn_call(&session, &sink, "get-candles").await;
        session.handle_frame(data("1", "candles", json!({"candles": []})));
        let frame = call.await.unwrap().unwrap();
        assert_eq!(frame.name, "candles");

        // A late ACK with the same identifier is a harmless no-op.
        session.handle_frame(ack("1"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently_of_arrival_order() {
        let sink = MockSink::new();
        let session = session(&sink);

        let first = spawn_call(&session, &sink, "first").await;
        let second = spawn_call(&session, &sink, "second").await;

        // Respond in reverse order.
        session.handle_frame(data("2", "second-reply", json!({"n": 2})));
        session.handle_frame(data("1", "first-reply", json!({"n": 1})));

        assert_eq!(first.await.unwrap().unwrap().msg, json!({"n": 1}));
        assert_eq!(second.await.unwrap().unwrap().msg, json!({"n": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_terminal_and_removes_the_pending_entry() {
        let sink = MockSink::new();
        let session = session(&sink);

        let call = spawn_call(&session, &sink, "core.get-profile").await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BlitzError::RequestTimeout { .. }));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_data_after_timeout_is_forwarded_to_push_listeners() {
        let sink = MockSink::new();
        let session = session(&sink);

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&forwarded);
        session.on_any(move |frame| log.lock().unwrap().push(frame.name.clone()));

        let call = spawn_call(&session, &sink, "slow").await;
        assert!(call.await.unwrap().is_err());

        // Resolved or timed out, never both: the late response no longer has
        // a pending entry and flows to the push path instead.
        session.handle_frame(data("1", "slow-reply", json!({})));
        assert_eq!(*forwarded.lock().unwrap(), vec!["slow-reply".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_requests() {
        let sink = MockSink::new();
        let session = session(&sink);

        let call = spawn_call(&session, &sink, "core.get-profile").await;
        session.fail_all_pending();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BlitzError::ConnectionLost));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn validator_failure_warns_but_still_resolves_raw() {
        let sink = MockSink::new();
        let session = session(&sink);

        let task_session = Arc::clone(&session);
        let validator: Validator = Arc::new(|_| Err("missing field `user_id`".to_string()));
        let call = tokio::spawn(async move {
            task_session
                .call_with("core.get-profile", "1.0", json!({}), Some(validator))
                .await
        });
        while sink.sent_count() == 0 {
            yield_now().await;
        }

        session.handle_frame(data("1", "profile", json!({"unexpected": true})));
        let frame = call.await.unwrap().unwrap();
        assert_eq!(frame.msg, json!({"unexpected": true}));
    }

    #[tokio::test]
    async fn call_envelope_wraps_inner_rpc() {
        let sink = MockSink::new();
        let session = session(&sink);

        let call = spawn_call(&session, &sink, "core.get-profile").await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, MSG_SEND);
        assert_eq!(sent[0].request_id.as_deref(), Some("1"));
        assert!(sent[0].local_time.is_some());
        assert_eq!(sent[0].msg["name"], "core.get-profile");
        assert_eq!(sent[0].msg["version"], "1.0");

        session.handle_frame(data("1", "profile", json!({})));
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_without_expected_response_registers_no_pending_entry() {
        let sink = MockSink::new();
        let session = session(&sink);

        let reply = session.send("authenticate", json!({"ssid": "x"}), false).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(session.pending_count(), 0);
        assert_eq!(sink.sent()[0].request_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn fire_carries_no_request_id() {
        let sink = MockSink::new();
        let session = session(&sink);

        session.fire("setOptions", json!({"sendResults": true})).await.unwrap();
        let sent = sink.sent();
        assert!(sent[0].request_id.is_none());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_builds_the_subscription_envelope() {
        let sink = MockSink::new();
        let session = session(&sink);

        session
            .subscribe("candle-generated", None, Some(json!({"active_id": 76, "size": 1})))
            .await
            .unwrap();
        session.unsubscribe("candle-generated", None, Some(json!({"active_id": 76, "size": 1}))).await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent[0].name, MSG_SUBSCRIBE);
        assert_eq!(sent[0].msg["params"]["routingFilters"]["active_id"], 76);
        assert!(sent[0].request_id.is_none());
        assert_eq!(sent[1].name, MSG_UNSUBSCRIBE);
        assert_eq!(sent[1].msg, sent[0].msg);
    }

    #[tokio::test]
    async fn failed_send_removes_the_pending_entry() {
        let sink = MockSink::failing();
        let session = Session::new(Arc::clone(&sink) as Arc<dyn FrameSink>);

        let err = session.call("core.get-profile", "1.0", json!({})).await.unwrap_err();
        assert!(matches!(err, BlitzError::Transport(_)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn unsolicited_push_reaches_named_listeners() {
        let sink = MockSink::new();
        let session = session(&sink);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        session.on("balance-changed", move |frame| {
            log.lock().unwrap().push(frame.msg.clone());
        });

        session.handle_frame(push("balance-changed", json!({"current_balance": {"id": 4}})));
        session.handle_frame(push("unrelated", json!({})));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
