//! Account surface: profile, balances and balance-change events.

use crate::client::Session;
use crate::domain::{Balance, BalanceChanged, Decoded, Profile};
use crate::error::{BlitzError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub struct AccountApi {
    session: Arc<Session>,
}

impl AccountApi {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Fetch the user profile. The payload nests the actual profile under
    /// `result` next to an `isSuccessful` flag.
    pub async fn get_profile(&self) -> Result<Decoded<Profile>> {
        let frame = self.session.call("core.get-profile", "1.0", json!({})).await?;
        let raw = match frame.msg.get("result") {
            Some(result) if result.is_object() => result.clone(),
            _ => frame.msg,
        };
        Ok(Decoded::from_value("profile", raw))
    }

    /// Fetch all funding balances. The array may arrive bare or nested under
    /// `result`.
    pub async fn get_balances(&self) -> Result<Vec<Balance>> {
        let frame = self
            .session
            .call("internal-billing.get-balances", "1.0", json!({}))
            .await?;
        let raw = frame.msg.get("result").cloned().unwrap_or(frame.msg);
        let items = match raw {
            Value::Array(items) => items,
            Value::Object(map) => map.into_values().collect(),
            other => {
                warn!(payload = %other, "unexpected balances payload shape");
                Vec::new()
            }
        };
        Ok(items
            .into_iter()
            .filter_map(|item| Decoded::<Balance>::from_value("balance", item).valid())
            .collect())
    }

    /// The practice balance, required before any demo trading.
    pub async fn get_demo_balance(&self) -> Result<Balance> {
        let balances = self.get_balances().await?;
        balances
            .into_iter()
            .find(Balance::is_demo)
            .ok_or_else(|| BlitzError::Auth("account has no demo balance".to_string()))
    }

    /// Fire-and-forget session options, e.g. `{"sendResults": true}` so trade
    /// outcomes are pushed back.
    pub async fn set_options(&self, options: Value) -> Result<()> {
        self.session.fire("setOptions", options).await
    }

    /// Subscribe to balance updates. Malformed events are logged and dropped.
    pub async fn subscribe_balance_changed(
        &self,
        handler: impl Fn(BalanceChanged) + Send + Sync + 'static,
    ) -> Result<()> {
        self.session.on("balance-changed", move |frame| {
            if let Some(event) =
                Decoded::<BalanceChanged>::from_value("balance-changed", frame.msg.clone()).valid()
            {
                handler(event);
            }
        });
        self.session.subscribe("balance-changed", Some("1.0"), None).await
    }

    /// Switch the active balance (demo/real).
    pub async fn change_balance(&self, balance_id: u64) -> Result<()> {
        self.session
            .call("change-balance", "1.0", json!({ "balance_id": balance_id }))
            .await?;
        Ok(())
    }
}
