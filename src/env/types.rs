//! Sensor, action and observation vocabulary shared by environment and
//! agents.

use crate::domain::{Balance, BlitzOptionConfig, Candle, Order, Position, TradeRequest};
use crate::error::{BlitzError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A named data stream the agent can subscribe to. The identifier is
/// canonical for the spec, e.g. `candle:76:1` or `mood:76`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub spec: SensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SensorSpec {
    Candle { active_id: u32, size: u32 },
    Mood { active_id: u32 },
    Position { user_id: u64, balance_id: u64 },
    Order { user_id: u64 },
}

impl Sensor {
    pub fn candle(active_id: u32, size: u32) -> Self {
        Self {
            id: format!("candle:{active_id}:{size}"),
            spec: SensorSpec::Candle { active_id, size },
        }
    }

    pub fn mood(active_id: u32) -> Self {
        Self {
            id: format!("mood:{active_id}"),
            spec: SensorSpec::Mood { active_id },
        }
    }

    pub fn position(user_id: u64, balance_id: u64) -> Self {
        Self {
            id: format!("position:{balance_id}"),
            spec: SensorSpec::Position { user_id, balance_id },
        }
    }

    pub fn order(user_id: u64) -> Self {
        Self {
            id: format!("order:{user_id}"),
            spec: SensorSpec::Order { user_id },
        }
    }
}

/// One reading from a sensor stream.
#[derive(Debug, Clone)]
pub enum SensorValue {
    Candle(Candle),
    Mood(f64),
    Position(Position),
    Order(Order),
}

impl SensorValue {
    pub fn as_candle(&self) -> Option<&Candle> {
        match self {
            SensorValue::Candle(candle) => Some(candle),
            _ => None,
        }
    }
}

/// What an agent may ask the environment to do.
#[derive(Debug, Clone)]
pub enum Action {
    Trade(TradeRequest),
    Subscribe(Sensor),
    Unsubscribe { sensor_id: String },
    Query(Query),
}

#[derive(Debug, Clone)]
pub enum Query {
    Positions { balance_id: u64 },
    Orders { balance_id: u64 },
    History { balance_id: u64, limit: u64, offset: u64 },
    Balances,
    Assets,
}

impl Action {
    /// Parse an action from its JSON form `{type, payload}`. Unknown action
    /// types and query methods are hard errors so misbehaving agents surface
    /// immediately instead of silently no-opping.
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BlitzError::UnknownAction("<missing type>".to_string()))?;
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        match kind {
            "trade" => {
                let request: TradeRequest = serde_json::from_value(payload)?;
                Ok(Action::Trade(request))
            }
            "subscribe" => Ok(Action::Subscribe(sensor_from_payload(&payload)?)),
            "unsubscribe" => {
                let sensor_id = payload
                    .get("sensorId")
                    .or_else(|| payload.get("sensor_id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BlitzError::Validation("unsubscribe payload lacks a sensor id".to_string())
                    })?;
                Ok(Action::Unsubscribe { sensor_id: sensor_id.to_string() })
            }
            "query" => Ok(Action::Query(query_from_payload(&payload)?)),
            other => Err(BlitzError::UnknownAction(other.to_string())),
        }
    }
}

fn sensor_from_payload(payload: &Value) -> Result<Sensor> {
    let spec: SensorSpec = serde_json::from_value(payload.clone())?;
    Ok(match spec {
        SensorSpec::Candle { active_id, size } => Sensor::candle(active_id, size),
        SensorSpec::Mood { active_id } => Sensor::mood(active_id),
        SensorSpec::Position { user_id, balance_id } => Sensor::position(user_id, balance_id),
        SensorSpec::Order { user_id } => Sensor::order(user_id),
    })
}

fn query_from_payload(payload: &Value) -> Result<Query> {
    let method = payload
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| BlitzError::UnknownQuery("<missing method>".to_string()))?;
    let params = payload.get("params").cloned().unwrap_or(Value::Null);
    let balance_id = || {
        params
            .get("balanceId")
            .or_else(|| params.get("balance_id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| BlitzError::Validation(format!("{method} requires a balance id")))
    };

    match method {
        "getPositions" => Ok(Query::Positions { balance_id: balance_id()? }),
        "getOrders" => Ok(Query::Orders { balance_id: balance_id()? }),
        "getHistory" => Ok(Query::History {
            balance_id: balance_id()?,
            limit: params.get("limit").and_then(Value::as_u64).unwrap_or(50),
            offset: params.get("offset").and_then(Value::as_u64).unwrap_or(0),
        }),
        "getBalances" => Ok(Query::Balances),
        "getAssets" => Ok(Query::Assets),
        other => Err(BlitzError::UnknownQuery(other.to_string())),
    }
}

/// Result of one executed action.
#[derive(Debug)]
pub enum ActionOutcome {
    Trade(crate::domain::TradeResponse),
    Subscribed(String),
    Unsubscribed(String),
    Positions(Vec<Position>),
    Orders(Vec<Order>),
    Balances(Vec<Balance>),
    Assets(Vec<BlitzOptionConfig>),
}

/// Everything an agent sees when deciding: the recent sensor readings plus a
/// consistent snapshot of account state, stamped with the server clock.
#[derive(Debug, Clone)]
pub struct Observation {
    pub sensors: HashMap<String, Vec<SensorValue>>,
    pub state: StateSnapshot,
    pub timestamp: u64,
}

impl Observation {
    pub fn sensor(&self, sensor_id: &str) -> &[SensorValue] {
        self.sensors.get(sensor_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Point-in-time copy of the environment state.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub balance: Decimal,
    pub open_positions: Vec<Position>,
    pub closed_count: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub total_pnl: Decimal,
    pub available_assets: Vec<BlitzOptionConfig>,
    pub server_time: u64,
}

/// Trading constraints the environment enforces on agents.
#[derive(Debug, Clone)]
pub struct EnvironmentRules {
    pub min_bet: Decimal,
    pub max_bet: Decimal,
    pub max_concurrent_positions: usize,
    pub allowed_instruments: Vec<String>,
}

impl Default for EnvironmentRules {
    fn default() -> Self {
        Self {
            min_bet: Decimal::ONE,
            max_bet: Decimal::from(1_000_000),
            max_concurrent_positions: 10,
            allowed_instruments: vec![crate::api::trading::INSTRUMENT_BLITZ.to_string()],
        }
    }
}

/// A decision-making strategy plugged into the environment loop. One agent
/// owns the loop at a time; callbacks take `&mut self`.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    /// Called once before the event loop starts; the usual place to
    /// subscribe sensors.
    async fn initialize(&mut self, env: &super::environment::TradingEnvironment) -> Result<()>;

    /// Called on every sensor update with a fresh observation.
    async fn on_observation(&mut self, observation: &Observation) -> Result<Vec<Action>>;

    /// Called exactly once per closed position.
    fn on_trade_result(&mut self, position: &Position);
}
