//! Momentum agent: trades with a run of same-direction candles.

use crate::domain::{CloseReason, Direction, Position, TradeRequest};
use crate::env::environment::TradingEnvironment;
use crate::env::types::{Action, Agent, Observation, Sensor};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

/// If the last `lookback` candles are all bullish it buys a call, all
/// bearish a put. At most one trade per expiration window.
pub struct MomentumAgent {
    active_id: u32,
    candle_size: u32,
    lookback: usize,
    trade_amount: Decimal,
    expiration_size: u64,
    profit_percent: u32,
    balance_id: u64,
    last_trade_time: u64,
    trade_count: u64,
}

impl MomentumAgent {
    pub fn new(active_id: u32) -> Self {
        Self {
            active_id,
            candle_size: 1,
            lookback: 3,
            trade_amount: Decimal::from(30),
            expiration_size: 60,
            profit_percent: 86,
            balance_id: 0,
            last_trade_time: 0,
            trade_count: 0,
        }
    }

    pub fn candle_size(mut self, candle_size: u32) -> Self {
        self.candle_size = candle_size;
        self
    }

    pub fn lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn trade_amount(mut self, trade_amount: Decimal) -> Self {
        self.trade_amount = trade_amount;
        self
    }

    pub fn expiration_size(mut self, expiration_size: u64) -> Self {
        self.expiration_size = expiration_size;
        self
    }

    fn sensor_id(&self) -> String {
        Sensor::candle(self.active_id, self.candle_size).id
    }

    fn momentum_direction(&self, observation: &Observation) -> Option<(Direction, f64)> {
        let readings = observation.sensor(&self.sensor_id());
        let candles: Vec<_> = readings.iter().filter_map(|value| value.as_candle()).collect();
        if candles.len() < self.lookback {
            return None;
        }

        let recent = &candles[candles.len() - self.lookback..];
        let last_close = recent[recent.len() - 1].close;
        if recent.iter().all(|candle| candle.is_bullish()) {
            Some((Direction::Call, last_close))
        } else if recent.iter().all(|candle| candle.is_bearish()) {
            Some((Direction::Put, last_close))
        } else {
            None
        }
    }
}

#[async_trait]
impl Agent for MomentumAgent {
    fn name(&self) -> &str {
        "momentum"
    }

    async fn initialize(&mut self, env: &TradingEnvironment) -> Result<()> {
        self.balance_id = env.balance_id();

        // Use the instrument's actual payout when the catalog knows it.
        if let Some(payout) = env
            .available_assets()
            .iter()
            .find(|asset| asset.active_id == self.active_id)
            .and_then(|asset| asset.payout_percent())
        {
            self.profit_percent = payout as u32;
        }

        info!(
            active_id = self.active_id,
            lookback = self.lookback,
            amount = %self.trade_amount,
            "momentum agent initialized"
        );
        env.execute_actions(vec![Action::Subscribe(Sensor::candle(
            self.active_id,
            self.candle_size,
        ))])
        .await;
        Ok(())
    }

    async fn on_observation(&mut self, observation: &Observation) -> Result<Vec<Action>> {
        // One trade per expiration window.
        if observation.timestamp.saturating_sub(self.last_trade_time) < self.expiration_size {
            return Ok(Vec::new());
        }

        let Some((direction, current_price)) = self.momentum_direction(observation) else {
            return Ok(Vec::new());
        };

        self.last_trade_time = observation.timestamp;
        self.trade_count += 1;
        info!(
            trade = self.trade_count,
            direction = %direction,
            amount = %self.trade_amount,
            expiration = self.expiration_size,
            "momentum signal"
        );

        Ok(vec![Action::Trade(TradeRequest {
            active_id: self.active_id,
            direction,
            price: self.trade_amount,
            balance_id: self.balance_id,
            expiration_size: self.expiration_size,
            profit_percent: Some(self.profit_percent),
            current_price: Some(current_price),
        })])
    }

    fn on_trade_result(&mut self, position: &Position) {
        let outcome = match position.close_reason {
            Some(CloseReason::Win) => "win",
            _ => "loss",
        };
        info!(position = %position.id, outcome, pnl = %position.pnl, "trade settled");
    }
}
