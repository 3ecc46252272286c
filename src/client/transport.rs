//! WebSocket transport: socket lifecycle, frame dispatch and reconnection.
//!
//! The transport owns the socket. Inbound frames are decoded on the reader
//! task and dispatched synchronously to name-keyed and global listeners;
//! outbound frames go through an unbounded channel into a writer task. On an
//! unexpected close the transport fires its disconnect hooks, then reconnects
//! with capped exponential backoff until `close()` disables reconnection.

use crate::client::wire::{Frame, MSG_TIME_SYNC};
use crate::error::{BlitzError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnection backoff defaults: 1s base, doubling, 30s cap.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Listener invoked for inbound frames. Handlers run synchronously on the
/// reader task, in registration order.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Token returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Reconnection delay schedule as a plain value, so tests can drive it
/// without timers: starts at `base`, doubles per failed attempt, saturates at
/// `max`, resets to `base` on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to apply before the next attempt. Doubles the stored delay
    /// (capped) for the attempt after that.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

/// Seam between the session layer and the socket, so request correlation can
/// be exercised against a fake transport in tests.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Encode and transmit one frame. Fails if not currently connected.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Milliseconds since this transport was created (the `local_time`
    /// envelope field).
    fn local_time_ms(&self) -> u64;

    /// Last server clock value observed from a `timeSync` push, if any.
    fn server_time_ms(&self) -> Option<u64>;
}

/// WebSocket transport with name-keyed listener dispatch and automatic
/// reconnection.
pub struct WsTransport {
    url: String,
    state: RwLock<ConnState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, FrameHandler)>>>,
    any_handlers: RwLock<Vec<(HandlerId, FrameHandler)>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    next_handler_id: AtomicU64,
    reconnect_enabled: AtomicBool,
    backoff: Mutex<Backoff>,
    server_clock_ms: AtomicU64,
    started_at: Instant,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Self::with_backoff(url, Backoff::default())
    }

    pub fn with_backoff(url: impl Into<String>, backoff: Backoff) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            state: RwLock::new(ConnState::Disconnected),
            writer: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            any_handlers: RwLock::new(Vec::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            reconnect_enabled: AtomicBool::new(true),
            backoff: Mutex::new(backoff),
            server_clock_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnState) {
        *self.state.write().unwrap() = state;
    }

    pub fn is_reconnect_enabled(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst)
    }

    /// Establish the socket. Resolves once the connection is open; a setup
    /// failure is returned to the caller without scheduling a reconnect.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnState::Connecting);
        match self.open_socket().await {
            Ok(stream) => {
                self.backoff.lock().unwrap().reset();
                self.install(stream);
                self.set_state(ConnState::Connected);
                info!(url = %self.url, "connected");
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnState::Disconnected);
                Err(err)
            }
        }
    }

    /// Disable reconnection and terminate the socket. Terminal from any
    /// state.
    pub fn close(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        self.set_state(ConnState::Disconnected);
        if let Some(tx) = self.writer.lock().unwrap().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Register a listener for frames with a specific name.
    pub fn on(&self, name: impl Into<String>, handler: impl Fn(&Frame) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap()
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a named listener. Returns false if it was not registered.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        match handlers.get_mut(name) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(entry_id, _)| *entry_id != id);
                before != entries.len()
            }
            None => false,
        }
    }

    /// Register a listener invoked for every inbound frame.
    pub fn on_any(&self, handler: impl Fn(&Frame) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.any_handlers.write().unwrap().push((id, Arc::new(handler)));
        id
    }

    pub fn off_any(&self, id: HandlerId) -> bool {
        let mut handlers = self.any_handlers.write().unwrap();
        let before = handlers.len();
        handlers.retain(|(entry_id, _)| *entry_id != id);
        before != handlers.len()
    }

    /// Register a hook invoked when the socket drops, before any reconnect is
    /// scheduled. The session uses this to fail outstanding requests.
    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.disconnect_handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Dispatch one decoded frame to listeners. Also captures the server
    /// clock from `timeSync` pushes.
    pub(crate) fn dispatch(&self, frame: Frame) {
        if frame.name == MSG_TIME_SYNC {
            if let Some(ms) = frame.msg.as_u64() {
                self.server_clock_ms.store(ms, Ordering::Relaxed);
            }
        }

        let named: Vec<FrameHandler> = self
            .handlers
            .read()
            .unwrap()
            .get(&frame.name)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in named {
            handler(&frame);
        }

        let global: Vec<FrameHandler> = self
            .any_handlers
            .read()
            .unwrap()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in global {
            handler(&frame);
        }
    }

    async fn open_socket(&self) -> Result<WsStream> {
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| BlitzError::Transport(format!("connection timeout: {}", self.url)))??;
        Ok(stream)
    }

    /// Spawn reader and writer tasks for a freshly opened socket.
    fn install(self: &Arc<Self>, stream: WsStream) {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.writer.lock().unwrap() = Some(tx);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = write.send(message).await {
                    warn!(error = %err, "websocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => transport.dispatch(frame),
                        Err(_) => debug!("ignoring non-envelope frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            transport.socket_closed().await;
        });
    }

    /// Runs on the reader task after the socket drops, for any reason.
    async fn socket_closed(self: Arc<Self>) {
        self.writer.lock().unwrap().take();

        let hooks: Vec<DisconnectHandler> = self.disconnect_handlers.read().unwrap().clone();
        for hook in hooks {
            hook();
        }

        if !self.is_reconnect_enabled() {
            self.set_state(ConnState::Disconnected);
            info!("connection closed");
            return;
        }

        self.set_state(ConnState::Reconnecting);
        loop {
            let delay = self.backoff.lock().unwrap().advance();
            warn!(delay_ms = delay.as_millis() as u64, "connection lost, reconnecting after backoff");
            tokio::time::sleep(delay).await;
            if !self.is_reconnect_enabled() {
                self.set_state(ConnState::Disconnected);
                return;
            }

            self.set_state(ConnState::Connecting);
            match self.open_socket().await {
                Ok(stream) => {
                    self.backoff.lock().unwrap().reset();
                    self.install(stream);
                    self.set_state(ConnState::Connected);
                    info!(url = %self.url, "reconnected");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "reconnect attempt failed");
                    self.set_state(ConnState::Reconnecting);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backoff_current(&self) -> Duration {
        self.backoff.lock().unwrap().current()
    }
}

#[async_trait]
impl FrameSink for WsTransport {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.state() != ConnState::Connected {
            return Err(BlitzError::Transport(format!(
                "not connected (state: {:?})",
                self.state()
            )));
        }
        let text = serde_json::to_string(frame)?;
        let writer = self.writer.lock().unwrap();
        match writer.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| BlitzError::Transport("connection closed".to_string())),
            None => Err(BlitzError::Transport("not connected".to_string())),
        }
    }

    fn local_time_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn server_time_ms(&self) -> Option<u64> {
        match self.server_clock_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}
