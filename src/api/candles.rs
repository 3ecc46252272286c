//! Candle streams and historical candle queries.

use crate::api::lenient_items;
use crate::client::Session;
use crate::domain::{Candle, CandlesResponse, Decoded};
use crate::error::Result;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

pub type CandleHandler = Arc<dyn Fn(&Candle) + Send + Sync>;

/// Real-time and historical candles. One handler per `(active, size)` stream;
/// events are routed by that key.
pub struct CandlesApi {
    session: Arc<Session>,
    handlers: DashMap<String, CandleHandler>,
}

impl CandlesApi {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let api = Arc::new(Self {
            session: Arc::clone(&session),
            handlers: DashMap::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&api);
        session.on("candle-generated", move |frame| {
            if let Some(api) = weak.upgrade() {
                api.dispatch(&frame.msg);
            }
        });

        api
    }

    /// Events arrive either as `{candles: [..]}` batches or as one bare
    /// candle object.
    fn dispatch(&self, payload: &Value) {
        let batch: Vec<Value> = match payload.get("candles").and_then(Value::as_array) {
            Some(candles) => candles.clone(),
            None => vec![payload.clone()],
        };

        for raw in batch {
            let Some(candle) = Decoded::<Candle>::from_value("candle", raw).valid() else {
                continue;
            };
            let key = stream_key(candle.active_id, candle.size);
            if let Some(handler) = self.handlers.get(&key) {
                handler(&candle);
            }
        }
    }

    /// Subscribe to real-time candles for one instrument and size.
    pub async fn subscribe_candles(
        &self,
        active_id: u32,
        size: u32,
        handler: impl Fn(&Candle) + Send + Sync + 'static,
    ) -> Result<()> {
        self.handlers.insert(stream_key(active_id, size), Arc::new(handler));
        self.session
            .subscribe(
                "candle-generated",
                None,
                Some(json!({ "active_id": active_id, "size": size })),
            )
            .await
    }

    /// Drop the handler and tear down the server-side stream.
    pub async fn unsubscribe_candles(&self, active_id: u32, size: u32) -> Result<()> {
        self.handlers.remove(&stream_key(active_id, size));
        self.session
            .unsubscribe(
                "candle-generated",
                None,
                Some(json!({ "active_id": active_id, "size": size })),
            )
            .await
    }

    /// Historical candles for a time window, in seconds since epoch.
    pub async fn get_candles(
        &self,
        active_id: u32,
        size: u32,
        from_id: u64,
        to_id: u64,
    ) -> Result<Vec<Candle>> {
        let frame = self
            .session
            .call(
                "get-candles",
                "2.0",
                json!({
                    "active_id": active_id,
                    "size": size,
                    "from_id": from_id,
                    "to_id": to_id,
                }),
            )
            .await?;

        match Decoded::<CandlesResponse>::from_value("candles", frame.msg.clone()) {
            Decoded::Valid(response) => Ok(response.candles),
            Decoded::Raw(raw) => Ok(lenient_items("candles", &raw, "candles")),
        }
    }

    /// The most recent `count` candles for an instrument.
    pub async fn get_first_candles(&self, active_id: u32, size: u32, count: u64) -> Result<Vec<Candle>> {
        let now = self
            .session
            .server_time_secs()
            .unwrap_or_else(|| chrono::Utc::now().timestamp() as u64);
        self.get_candles(active_id, size, now - count * u64::from(size), now).await
    }
}

fn stream_key(active_id: u32, size: u32) -> String {
    format!("{active_id}_{size}")
}
