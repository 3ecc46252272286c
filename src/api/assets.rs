//! Instrument catalog: initialization data and blitz-option configs.

use crate::client::Session;
use crate::domain::BlitzOptionConfig;
use crate::error::Result;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct AssetsApi {
    session: Arc<Session>,
}

impl AssetsApi {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Full initialization payload with every instrument group.
    pub async fn get_initialization_data(&self) -> Result<Value> {
        let frame = self
            .session
            .call("get-initialization-data", "4.0", json!({}))
            .await?;
        Ok(frame.msg)
    }

    /// Tradable blitz-option instruments: enabled and not suspended.
    pub async fn list_blitz_options(&self) -> Result<Vec<BlitzOptionConfig>> {
        let init_data = self.get_initialization_data().await?;
        Ok(parse_blitz_options(&init_data)
            .into_iter()
            .filter(BlitzOptionConfig::is_tradable)
            .collect())
    }
}

/// Extract blitz-option configs from the initialization payload. Actives live
/// under `turbo.actives` (falling back to `binary.actives` then a top-level
/// `actives` map), keyed by their numeric id.
pub fn parse_blitz_options(init_data: &Value) -> Vec<BlitzOptionConfig> {
    let actives = ["turbo", "binary"]
        .iter()
        .find_map(|group| init_data.get(group).and_then(|g| g.get("actives")))
        .or_else(|| init_data.get("actives"))
        .and_then(Value::as_object);

    let Some(actives) = actives else {
        return Vec::new();
    };

    let mut configs: Vec<BlitzOptionConfig> = actives
        .iter()
        .filter_map(|(id, active)| {
            let active_id: u32 = id.parse().ok()?;
            Some(parse_active(active_id, active))
        })
        .collect();

    configs.sort_by(|a, b| a.name.cmp(&b.name));
    configs
}

fn parse_active(active_id: u32, active: &Value) -> BlitzOptionConfig {
    let name = strip_front_prefix(active.get("name").and_then(Value::as_str).unwrap_or(""));
    let description = strip_front_prefix(
        active
            .get("description")
            .or_else(|| active.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(""),
    );

    // Suspension shows up under two different keys depending on the group.
    let is_suspended = active.get("is_suspended").and_then(Value::as_bool) == Some(true)
        || active.get("suspended").and_then(Value::as_bool) == Some(true);
    let is_enabled = active.get("enabled").and_then(Value::as_bool) != Some(false);

    BlitzOptionConfig {
        active_id,
        name,
        description,
        expiration_times: active
            .get("expiration_times")
            .and_then(Value::as_array)
            .map(|times| times.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default(),
        deadtime: active.get("deadtime").and_then(Value::as_u64).unwrap_or(0),
        minimal_bet: decimal_or(active.get("minimal_bet"), Decimal::ONE),
        maximal_bet: decimal_or(active.get("maximal_bet"), Decimal::from(1_000_000)),
        profit_commission: active
            .pointer("/option/profit/commission")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        is_enabled,
        is_suspended,
    }
}

fn strip_front_prefix(name: &str) -> String {
    name.strip_prefix("front.").unwrap_or(name).to_string()
}

fn decimal_or(value: Option<&Value>, fallback: Decimal) -> Decimal {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(fallback)
}
