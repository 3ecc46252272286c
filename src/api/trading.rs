//! Order placement and portfolio queries for blitz options.

use crate::api::lenient_items;
use crate::client::Session;
use crate::domain::{
    Decoded, Order, OrdersResponse, Position, PositionsResponse, TradeRequest, TradeResponse,
};
use crate::error::{BlitzError, Result};
use serde_json::json;
use std::sync::{Arc, RwLock, Weak};
use tracing::info;

/// Wire status code for an accepted trade.
const STATUS_OK: u16 = 2000;
/// Option type id of a blitz option on the open-option RPC.
const BLITZ_OPTION_TYPE_ID: u32 = 12;
/// Payout assumed when the caller does not supply one.
const DEFAULT_PROFIT_PERCENT: u32 = 80;

pub const INSTRUMENT_BLITZ: &str = "blitz-option";

pub type PositionHandler = Arc<dyn Fn(&Position) + Send + Sync>;
pub type OrderHandler = Arc<dyn Fn(&Order) + Send + Sync>;

/// Trading surface: places blitz options and relays portfolio change events
/// to registered handlers.
pub struct TradingApi {
    session: Arc<Session>,
    position_handlers: RwLock<Vec<PositionHandler>>,
    order_handlers: RwLock<Vec<OrderHandler>>,
}

impl TradingApi {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let api = Arc::new(Self {
            session: Arc::clone(&session),
            position_handlers: RwLock::new(Vec::new()),
            order_handlers: RwLock::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&api);
        session.on("portfolio.position-changed", move |frame| {
            let Some(api) = weak.upgrade() else { return };
            if let Some(position) =
                Decoded::<Position>::from_value("position-changed", frame.msg.clone()).valid()
            {
                let handlers = api.position_handlers.read().unwrap().clone();
                for handler in handlers {
                    handler(&position);
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&api);
        session.on("portfolio.order-changed", move |frame| {
            let Some(api) = weak.upgrade() else { return };
            if let Some(order) =
                Decoded::<Order>::from_value("order-changed", frame.msg.clone()).valid()
            {
                let handlers = api.order_handlers.read().unwrap().clone();
                for handler in handlers {
                    handler(&order);
                }
            }
        });

        api
    }

    /// Place one blitz option. The expiry is an absolute server timestamp
    /// computed from the last observed server clock; a non-2000 status on the
    /// response frame is a rejection.
    pub async fn buy_blitz_option(&self, request: &TradeRequest) -> Result<TradeResponse> {
        let server_now = self.session.server_time_secs().unwrap_or_else(local_now_secs);
        let expired = server_now + request.expiration_size;
        let value = request
            .current_price
            .map(|price| (price * 1_000_000.0).round() as u64)
            .unwrap_or(0);
        let profit_percent = request.profit_percent.unwrap_or(DEFAULT_PROFIT_PERCENT);

        let frame = self
            .session
            .call(
                "binary-options.open-option",
                "2.0",
                json!({
                    "user_balance_id": request.balance_id,
                    "active_id": request.active_id,
                    "option_type_id": BLITZ_OPTION_TYPE_ID,
                    "direction": request.direction,
                    "expired": expired,
                    "refund_value": 0,
                    "price": request.price,
                    "value": value,
                    "profit_percent": profit_percent,
                    "expiration_size": request.expiration_size,
                }),
            )
            .await?;

        if let Some(status) = frame.status {
            if status != STATUS_OK {
                return Err(BlitzError::TradeRejected {
                    status,
                    detail: frame.msg.to_string(),
                });
            }
        }

        let response = Decoded::<TradeResponse>::from_value("open-option", frame.msg)
            .into_result("open-option")?;
        info!(
            option_id = response.id,
            active_id = request.active_id,
            direction = %request.direction,
            price = %request.price,
            "option placed"
        );
        Ok(response)
    }

    /// Register a position handler and open the server-side stream for this
    /// user and balance.
    pub async fn subscribe_positions(
        &self,
        user_id: u64,
        balance_id: u64,
        handler: impl Fn(&Position) + Send + Sync + 'static,
    ) -> Result<()> {
        self.position_handlers.write().unwrap().push(Arc::new(handler));
        self.session
            .subscribe(
                "portfolio.position-changed",
                Some("3.0"),
                Some(json!({
                    "user_id": user_id,
                    "user_balance_id": balance_id,
                    "instrument_type": INSTRUMENT_BLITZ,
                })),
            )
            .await
    }

    /// Register an order handler and open the server-side stream.
    pub async fn subscribe_orders(
        &self,
        user_id: u64,
        handler: impl Fn(&Order) + Send + Sync + 'static,
    ) -> Result<()> {
        self.order_handlers.write().unwrap().push(Arc::new(handler));
        self.session
            .subscribe(
                "portfolio.order-changed",
                Some("2.0"),
                Some(json!({
                    "user_id": user_id,
                    "instrument_type": INSTRUMENT_BLITZ,
                })),
            )
            .await
    }

    /// Register an additional position handler without touching the stream.
    pub fn on_position_changed(&self, handler: impl Fn(&Position) + Send + Sync + 'static) {
        self.position_handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Open positions on a balance.
    pub async fn get_positions(&self, balance_id: u64) -> Result<Vec<Position>> {
        let frame = self
            .session
            .call(
                "portfolio.get-positions",
                "4.0",
                json!({
                    "user_balance_id": balance_id,
                    "instrument_types": [INSTRUMENT_BLITZ],
                }),
            )
            .await?;
        Ok(positions_from(frame.msg))
    }

    /// Pending orders on a balance.
    pub async fn get_orders(&self, balance_id: u64) -> Result<Vec<Order>> {
        let frame = self
            .session
            .call(
                "portfolio.get-orders",
                "2.0",
                json!({
                    "user_balance_id": balance_id,
                    "instrument_types": [INSTRUMENT_BLITZ],
                }),
            )
            .await?;
        match Decoded::<OrdersResponse>::from_value("orders", frame.msg.clone()) {
            Decoded::Valid(response) => Ok(response.orders),
            Decoded::Raw(raw) => Ok(lenient_items("orders", &raw, "orders")),
        }
    }

    /// Closed trade history, newest first.
    pub async fn get_history_positions(
        &self,
        balance_id: u64,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Position>> {
        let frame = self
            .session
            .call(
                "portfolio.get-history-positions",
                "1.0",
                json!({
                    "user_balance_id": balance_id,
                    "instrument_types": [INSTRUMENT_BLITZ],
                    "limit": limit,
                    "offset": offset,
                }),
            )
            .await?;
        Ok(positions_from(frame.msg))
    }
}

fn positions_from(msg: serde_json::Value) -> Vec<Position> {
    match Decoded::<PositionsResponse>::from_value("positions", msg) {
        Decoded::Valid(response) => response.positions,
        Decoded::Raw(raw) => lenient_items("positions", &raw, "positions"),
    }
}

fn local_now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
