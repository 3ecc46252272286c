//! Typed wire models for the broker protocol.
//!
//! Response shapes are decoded leniently at the boundary: [`Decoded`] carries
//! either the strongly typed value or the raw payload when the shape check
//! fails, which is the fail-open contract expressed as a return type instead
//! of an exception path.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::error::{BlitzError, Result};

/// Balance type of the practice account.
pub const DEMO_BALANCE_TYPE: u32 = 4;

/// Result of a lenient typed decode at the protocol boundary.
#[derive(Debug, Clone)]
pub enum Decoded<T> {
    Valid(T),
    /// The payload failed the shape check; kept raw so callers can decide
    /// whether to degrade or reject.
    Raw(Value),
}

impl<T: DeserializeOwned> Decoded<T> {
    /// Decode `value` into `T`, logging a warning and keeping the raw
    /// payload on failure.
    pub fn from_value(what: &str, value: Value) -> Self {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(decoded) => Decoded::Valid(decoded),
            Err(err) => {
                warn!(what, error = %err, "response failed typed decode, keeping raw payload");
                Decoded::Raw(value)
            }
        }
    }
}

impl<T> Decoded<T> {
    pub fn valid(self) -> Option<T> {
        match self {
            Decoded::Valid(value) => Some(value),
            Decoded::Raw(_) => None,
        }
    }

    /// Treat a raw fallback as a hard validation failure. For callers that
    /// cannot proceed without the typed shape.
    pub fn into_result(self, what: &str) -> Result<T> {
        match self {
            Decoded::Valid(value) => Ok(value),
            Decoded::Raw(_) => Err(BlitzError::Validation(format!(
                "{what}: unexpected response shape"
            ))),
        }
    }
}

/// Direction of a blitz option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Call => write!(f, "call"),
            Direction::Put => write!(f, "put"),
        }
    }
}

/// Why a position closed. The wire spells a loss "loose".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "win")]
    Win,
    #[serde(rename = "loose")]
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Position identifiers are numeric in real-time events and string hashes in
/// history responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionId {
    Num(u64),
    Hash(String),
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionId::Num(id) => write!(f, "{id}"),
            PositionId::Hash(id) => write!(f, "{id}"),
        }
    }
}

impl From<u64> for PositionId {
    fn from(id: u64) -> Self {
        PositionId::Num(id)
    }
}

/// User profile. Arrives nested under `result` in the RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: u64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub nickname: String,
    pub balance_id: u64,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub currency: String,
}

/// One funding balance of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub id: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(rename = "type")]
    pub kind: u32,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub is_fiat: bool,
}

impl Balance {
    pub fn is_demo(&self) -> bool {
        self.kind == DEMO_BALANCE_TYPE
    }
}

/// `balance-changed` push payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceChanged {
    pub current_balance: BalanceSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: u64,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(rename = "type", default)]
    pub kind: u32,
}

/// One candle. The wire uses `min`/`max` for the low/high quotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    #[serde(default)]
    pub id: u64,
    pub from: u64,
    pub to: u64,
    pub open: f64,
    pub close: f64,
    #[serde(rename = "min")]
    pub low: f64,
    #[serde(rename = "max")]
    pub high: f64,
    #[serde(default)]
    pub volume: f64,
    pub active_id: u32,
    pub size: u32,
    #[serde(default)]
    pub at: u64,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandlesResponse {
    pub candles: Vec<Candle>,
}

/// An open or closed position. Real-time events carry numeric ids and
/// top-level direction; history rows use string hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub user_balance_id: u64,
    #[serde(default)]
    pub active_id: u32,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub open_time: u64,
    #[serde(default)]
    pub close_time: Option<u64>,
    #[serde(default)]
    pub open_quote: f64,
    #[serde(default)]
    pub close_quote: Option<f64>,
    #[serde(default)]
    pub invest: Decimal,
    #[serde(default)]
    pub pnl: Decimal,
    #[serde(default)]
    pub pnl_realized: Decimal,
    pub status: PositionStatus,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    #[serde(default)]
    pub expiration_time: Option<u64>,
    #[serde(default)]
    pub expiration_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsResponse {
    pub positions: Vec<Position>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// A pending or filled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub user_balance_id: u64,
    #[serde(default)]
    pub active_id: u32,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersResponse {
    pub orders: Vec<Order>,
}

/// Traders mood (sentiment) for an asset, 0..1 share of call buyers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradersMood {
    pub asset_id: u32,
    pub value: f64,
    #[serde(default)]
    pub instrument_type: Option<String>,
}

/// Configuration of one tradable blitz-option instrument, extracted from the
/// initialization data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlitzOptionConfig {
    pub active_id: u32,
    pub name: String,
    pub description: String,
    pub expiration_times: Vec<u64>,
    pub deadtime: u64,
    pub minimal_bet: Decimal,
    pub maximal_bet: Decimal,
    pub profit_commission: f64,
    pub is_enabled: bool,
    pub is_suspended: bool,
}

impl BlitzOptionConfig {
    pub fn is_tradable(&self) -> bool {
        self.is_enabled && !self.is_suspended
    }

    /// Payout percentage after commission, if the commission is known.
    pub fn payout_percent(&self) -> Option<f64> {
        (self.profit_commission > 0.0).then(|| 100.0 - self.profit_commission)
    }
}

/// Parameters for placing one blitz-option trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub active_id: u32,
    pub direction: Direction,
    pub price: Decimal,
    pub balance_id: u64,
    pub expiration_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
}

/// Server confirmation for a placed option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponse {
    pub id: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub exp: u64,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub profit_income: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn decoded_valid_and_raw_fallback() {
        let ok = Decoded::<Balance>::from_value(
            "balance",
            json!({"id": 10, "type": 4, "amount": 1000.5, "currency": "USD", "is_fiat": true}),
        );
        let balance = ok.into_result("balance").unwrap();
        assert!(balance.is_demo());
        assert_eq!(balance.amount, dec!(1000.5));

        let bad = Decoded::<Balance>::from_value("balance", json!({"unexpected": true}));
        assert!(matches!(bad, Decoded::Raw(_)));
        assert!(bad.into_result("balance").is_err());
    }

    #[test]
    fn candle_wire_aliases_min_max() {
        let candle: Candle = serde_json::from_value(json!({
            "id": 1, "from": 100, "to": 101, "open": 1.10, "close": 1.12,
            "min": 1.09, "max": 1.13, "volume": 40.0, "active_id": 76, "size": 1, "at": 100500
        }))
        .unwrap();
        assert_eq!(candle.low, 1.09);
        assert_eq!(candle.high, 1.13);
        assert!(candle.is_bullish());
    }

    #[test]
    fn position_parses_realtime_and_history_ids() {
        let realtime: Position = serde_json::from_value(json!({
            "id": 42, "status": "open", "direction": "call", "pnl": 0, "active_id": 76
        }))
        .unwrap();
        assert_eq!(realtime.id, PositionId::Num(42));
        assert_eq!(realtime.direction, Some(Direction::Call));

        let history: Position = serde_json::from_value(json!({
            "id": "a1b2c3", "status": "closed", "close_reason": "loose", "pnl": -30.0
        }))
        .unwrap();
        assert_eq!(history.id, PositionId::Hash("a1b2c3".to_string()));
        assert_eq!(history.close_reason, Some(CloseReason::Loss));
        assert_eq!(history.pnl, dec!(-30));
    }

    #[test]
    fn trade_request_uses_camel_case_on_the_wire() {
        let request: TradeRequest = serde_json::from_value(json!({
            "activeId": 76,
            "direction": "put",
            "price": 30,
            "balanceId": 10,
            "expirationSize": 60
        }))
        .unwrap();
        assert_eq!(request.active_id, 76);
        assert_eq!(request.direction, Direction::Put);
        assert_eq!(request.profit_percent, None);
    }

    #[test]
    fn payout_percent_requires_known_commission() {
        let config = BlitzOptionConfig {
            active_id: 76,
            name: "EURUSD".to_string(),
            description: "EUR/USD".to_string(),
            expiration_times: vec![30, 60],
            deadtime: 3,
            minimal_bet: dec!(1),
            maximal_bet: dec!(5000),
            profit_commission: 14.0,
            is_enabled: true,
            is_suspended: false,
        };
        assert_eq!(config.payout_percent(), Some(86.0));
        assert!(config.is_tradable());
    }
}
