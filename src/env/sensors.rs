//! Sensor multiplexing: agent-facing streams over the broker subscriptions.

use crate::api::{CandlesApi, SubscriptionsApi, TradingApi};
use crate::env::types::{Sensor, SensorSpec, SensorValue};
use crate::error::Result;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

const DEFAULT_BUFFER_CAPACITY: usize = 100;

pub type UpdateListener = Arc<dyn Fn(&str, &SensorValue) + Send + Sync>;

/// Owns the active sensor set and a bounded reading buffer per sensor.
/// Subscribing an already-active sensor is a no-op, as is unsubscribing an
/// unknown one.
pub struct SensorManager {
    candles: Arc<CandlesApi>,
    trading: Arc<TradingApi>,
    subscriptions: Arc<SubscriptionsApi>,
    active: DashMap<String, Sensor>,
    buffers: DashMap<String, VecDeque<SensorValue>>,
    listeners: RwLock<Vec<UpdateListener>>,
    capacity: usize,
}

impl SensorManager {
    pub fn new(
        candles: Arc<CandlesApi>,
        trading: Arc<TradingApi>,
        subscriptions: Arc<SubscriptionsApi>,
    ) -> Arc<Self> {
        Self::with_capacity(candles, trading, subscriptions, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(
        candles: Arc<CandlesApi>,
        trading: Arc<TradingApi>,
        subscriptions: Arc<SubscriptionsApi>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            candles,
            trading,
            subscriptions,
            active: DashMap::new(),
            buffers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            capacity,
        })
    }

    /// Activate a sensor and open its broker-side stream. Duplicate
    /// subscriptions keep the existing buffer untouched.
    pub async fn subscribe(self: &Arc<Self>, sensor: Sensor) -> Result<()> {
        if self.active.contains_key(&sensor.id) {
            debug!(sensor_id = %sensor.id, "sensor already active");
            return Ok(());
        }
        self.active.insert(sensor.id.clone(), sensor.clone());
        self.buffers.insert(sensor.id.clone(), VecDeque::new());

        // A failed stream open must leave no registration behind, or the
        // dedup check would turn every retry into a no-op.
        if let Err(err) = self.open_stream(&sensor).await {
            self.active.remove(&sensor.id);
            self.buffers.remove(&sensor.id);
            return Err(err);
        }
        Ok(())
    }

    async fn open_stream(self: &Arc<Self>, sensor: &Sensor) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let sensor_id = sensor.id.clone();
        match sensor.spec {
            SensorSpec::Candle { active_id, size } => {
                self.candles
                    .subscribe_candles(active_id, size, move |candle| {
                        if let Some(manager) = weak.upgrade() {
                            manager.push(&sensor_id, SensorValue::Candle(candle.clone()));
                        }
                    })
                    .await?;
            }
            SensorSpec::Mood { active_id } => {
                self.subscriptions
                    .subscribe_traders_mood(active_id, move |value| {
                        if let Some(manager) = weak.upgrade() {
                            manager.push(&sensor_id, SensorValue::Mood(value));
                        }
                    })
                    .await?;
            }
            SensorSpec::Position { user_id, balance_id } => {
                self.trading
                    .subscribe_positions(user_id, balance_id, move |position| {
                        if let Some(manager) = weak.upgrade() {
                            manager.push(&sensor_id, SensorValue::Position(position.clone()));
                        }
                    })
                    .await?;
            }
            SensorSpec::Order { user_id } => {
                self.trading
                    .subscribe_orders(user_id, move |order| {
                        if let Some(manager) = weak.upgrade() {
                            manager.push(&sensor_id, SensorValue::Order(order.clone()));
                        }
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Deactivate a sensor and drop its buffer. Only candle streams have a
    /// broker-side teardown; the other streams just stop being buffered.
    pub async fn unsubscribe(&self, sensor_id: &str) -> Result<()> {
        let Some((_, sensor)) = self.active.remove(sensor_id) else {
            debug!(sensor_id, "unsubscribe for inactive sensor ignored");
            return Ok(());
        };
        self.buffers.remove(sensor_id);

        if let SensorSpec::Candle { active_id, size } = sensor.spec {
            self.candles.unsubscribe_candles(active_id, size).await?;
        }
        Ok(())
    }

    /// Latest buffered readings for one sensor, oldest first.
    pub fn latest(&self, sensor_id: &str) -> Vec<SensorValue> {
        self.buffers
            .get(sensor_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_active(&self) -> Vec<Sensor> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of every buffer, keyed by sensor id.
    pub fn get_all(&self) -> HashMap<String, Vec<SensorValue>> {
        self.buffers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Register a listener fired after every buffered reading.
    pub fn on_update(&self, listener: impl Fn(&str, &SensorValue) + Send + Sync + 'static) {
        self.listeners.write().unwrap().push(Arc::new(listener));
    }

    fn push(&self, sensor_id: &str, value: SensorValue) {
        {
            // Readings for sensors unsubscribed in the meantime are dropped.
            let Some(mut buffer) = self.buffers.get_mut(sensor_id) else {
                return;
            };
            buffer.push_back(value.clone());
            if buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }

        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(sensor_id, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{push, MockSink};
    use crate::client::transport::FrameSink;
    use crate::client::Session;
    use serde_json::json;
    use std::sync::Mutex;

    fn setup(sink: &Arc<MockSink>) -> (Arc<SensorManager>, Arc<Session>) {
        let session = Session::new(Arc::clone(sink) as Arc<dyn FrameSink>);
        let candles = CandlesApi::new(Arc::clone(&session));
        let trading = TradingApi::new(Arc::clone(&session));
        let subscriptions = Arc::new(SubscriptionsApi::new(Arc::clone(&session)));
        (SensorManager::new(candles, trading, subscriptions), session)
    }

    fn candle_json(close: f64) -> serde_json::Value {
        json!({
            "from": 100, "to": 160, "open": 1.0, "close": close,
            "min": 0.99, "max": 1.05, "active_id": 76, "size": 1
        })
    }

    #[tokio::test]
    async fn readings_flow_into_the_sensor_buffer() {
        let sink = MockSink::new();
        let (sensors, session) = setup(&sink);

        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();

        let notified = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&notified);
        sensors.on_update(move |sensor_id, _| log.lock().unwrap().push(sensor_id.to_string()));

        session.handle_frame(push("candle-generated", candle_json(1.01)));
        session.handle_frame(push("candle-generated", candle_json(1.02)));

        let latest = sensors.latest("candle:76:1");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].as_candle().unwrap().close, 1.02);
        assert_eq!(notified.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn buffer_is_bounded_fifo() {
        let sink = MockSink::new();
        let session = Session::new(Arc::clone(&sink) as Arc<dyn FrameSink>);
        let candles = CandlesApi::new(Arc::clone(&session));
        let trading = TradingApi::new(Arc::clone(&session));
        let subscriptions = Arc::new(SubscriptionsApi::new(Arc::clone(&session)));
        let sensors = SensorManager::with_capacity(candles, trading, subscriptions, 3);

        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();
        for i in 0..5 {
            session.handle_frame(push("candle-generated", candle_json(1.0 + i as f64)));
        }

        let latest = sensors.latest("candle:76:1");
        assert_eq!(latest.len(), 3);
        // Oldest readings were evicted first.
        assert_eq!(latest[0].as_candle().unwrap().close, 3.0);
        assert_eq!(latest[2].as_candle().unwrap().close, 5.0);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_a_no_op() {
        let sink = MockSink::new();
        let (sensors, session) = setup(&sink);

        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();
        session.handle_frame(push("candle-generated", candle_json(1.01)));
        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();

        // One outbound subscription and an intact buffer.
        assert_eq!(sink.sent_count(), 1);
        assert_eq!(sensors.latest("candle:76:1").len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_buffering() {
        let sink = MockSink::new();
        let (sensors, session) = setup(&sink);

        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();
        sensors.unsubscribe("candle:76:1").await.unwrap();
        sensors.unsubscribe("candle:76:1").await.unwrap();
        sensors.unsubscribe("never-existed").await.unwrap();

        session.handle_frame(push("candle-generated", candle_json(1.01)));
        assert!(sensors.latest("candle:76:1").is_empty());
        assert!(sensors.list_active().is_empty());

        // Exactly one teardown went out for the one active stream.
        let teardowns = sink
            .sent()
            .iter()
            .filter(|frame| frame.name == "unsubscribeMessage")
            .count();
        assert_eq!(teardowns, 1);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_registration_and_can_be_retried() {
        let sink = MockSink::failing();
        let (sensors, session) = setup(&sink);

        let err = sensors.subscribe(Sensor::candle(76, 1)).await;
        assert!(err.is_err());
        assert!(sensors.list_active().is_empty());
        assert!(sensors.latest("candle:76:1").is_empty());

        // Once the transport is back the same sensor subscribes cleanly
        // instead of hitting the dedup check.
        sink.recover();
        sensors.subscribe(Sensor::candle(76, 1)).await.unwrap();
        assert_eq!(sensors.list_active().len(), 1);

        session.handle_frame(push("candle-generated", candle_json(1.01)));
        assert_eq!(sensors.latest("candle:76:1").len(), 1);
    }

    #[tokio::test]
    async fn mood_sensor_buffers_values() {
        let sink = MockSink::new();
        let (sensors, session) = setup(&sink);

        sensors.subscribe(Sensor::mood(76)).await.unwrap();
        session.handle_frame(push("traders-mood-changed", json!({"asset_id": 76, "value": 0.58})));

        let latest = sensors.latest("mood:76");
        assert_eq!(latest.len(), 1);
        assert!(matches!(latest[0], SensorValue::Mood(value) if value == 0.58));
    }
}
