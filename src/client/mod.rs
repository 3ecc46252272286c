//! Protocol client: transport, request correlation and authentication.

pub mod auth;
pub mod session;
pub mod transport;
pub mod wire;

pub use session::Session;
pub use transport::{Backoff, ConnState, FrameSink, HandlerId, WsTransport};
pub use wire::Frame;

#[cfg(test)]
pub(crate) mod testing {
    use super::transport::FrameSink;
    use super::wire::{Frame, MSG_ACK};
    use crate::error::{BlitzError, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory transport fake: records outbound frames, inbound frames are
    /// injected straight into `Session::handle_frame`.
    pub(crate) struct MockSink {
        sent: Mutex<Vec<Frame>>,
        fail_sends: AtomicBool,
    }

    impl MockSink {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            let sink = Self::new();
            sink.fail_sends.store(true, Ordering::SeqCst);
            sink
        }

        /// Let sends succeed again, as after a reconnect.
        pub(crate) fn recover(&self) {
            self.fail_sends.store(false, Ordering::SeqCst);
        }

        pub(crate) fn sent(&self) -> Vec<Frame> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send_frame(&self, frame: &Frame) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(BlitzError::Transport("not connected".to_string()));
            }
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn local_time_ms(&self) -> u64 {
            0
        }

        fn server_time_ms(&self) -> Option<u64> {
            None
        }
    }

    /// Acknowledgment frame for a request id, as the server sends it.
    pub(crate) fn ack(request_id: &str) -> Frame {
        Frame {
            name: MSG_ACK.to_string(),
            request_id: Some(request_id.to_string()),
            msg: serde_json::json!({"success": true}),
            local_time: None,
            status: None,
        }
    }

    /// Data response frame carrying the result of a call.
    pub(crate) fn data(request_id: &str, name: &str, msg: Value) -> Frame {
        Frame {
            name: name.to_string(),
            request_id: Some(request_id.to_string()),
            msg,
            local_time: None,
            status: None,
        }
    }

    /// Unsolicited push frame with no request id.
    pub(crate) fn push(name: &str, msg: Value) -> Frame {
        Frame::named(name, msg)
    }
}
