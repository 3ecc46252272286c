//! Dispatch of agent actions onto the broker APIs.

use crate::api::{AccountApi, AssetsApi, TradingApi};
use crate::env::sensors::SensorManager;
use crate::env::types::{Action, ActionOutcome, Query};
use crate::error::Result;
use std::sync::Arc;

/// Executes one action at a time. Errors propagate to the caller; batching
/// and fail-open handling live in the environment, not here.
pub struct ActionExecutor {
    trading: Arc<TradingApi>,
    account: Arc<AccountApi>,
    assets: Arc<AssetsApi>,
    sensors: Arc<SensorManager>,
}

impl ActionExecutor {
    pub fn new(
        trading: Arc<TradingApi>,
        account: Arc<AccountApi>,
        assets: Arc<AssetsApi>,
        sensors: Arc<SensorManager>,
    ) -> Self {
        Self { trading, account, assets, sensors }
    }

    pub async fn execute(&self, action: Action) -> Result<ActionOutcome> {
        match action {
            Action::Trade(request) => {
                let response = self.trading.buy_blitz_option(&request).await?;
                Ok(ActionOutcome::Trade(response))
            }
            Action::Subscribe(sensor) => {
                let sensor_id = sensor.id.clone();
                self.sensors.subscribe(sensor).await?;
                Ok(ActionOutcome::Subscribed(sensor_id))
            }
            Action::Unsubscribe { sensor_id } => {
                self.sensors.unsubscribe(&sensor_id).await?;
                Ok(ActionOutcome::Unsubscribed(sensor_id))
            }
            Action::Query(query) => self.query(query).await,
        }
    }

    async fn query(&self, query: Query) -> Result<ActionOutcome> {
        match query {
            Query::Positions { balance_id } => {
                Ok(ActionOutcome::Positions(self.trading.get_positions(balance_id).await?))
            }
            Query::Orders { balance_id } => {
                Ok(ActionOutcome::Orders(self.trading.get_orders(balance_id).await?))
            }
            Query::History { balance_id, limit, offset } => Ok(ActionOutcome::Positions(
                self.trading.get_history_positions(balance_id, limit, offset).await?,
            )),
            Query::Balances => Ok(ActionOutcome::Balances(self.account.get_balances().await?)),
            Query::Assets => Ok(ActionOutcome::Assets(self.assets.list_blitz_options().await?)),
        }
    }
}
