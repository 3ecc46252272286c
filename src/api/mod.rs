//! Typed facades over the protocol session, one per broker subsystem.

pub mod account;
pub mod assets;
pub mod candles;
pub mod subscriptions;
pub mod trading;

pub use account::AccountApi;
pub use assets::AssetsApi;
pub use candles::CandlesApi;
pub use subscriptions::SubscriptionsApi;
pub use trading::TradingApi;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Decode an array under `key`, keeping the entries that pass the shape
/// check and skipping the rest. Fallback path for responses that failed the
/// whole-payload decode.
pub(crate) fn lenient_items<T: DeserializeOwned>(what: &str, payload: &Value, key: &str) -> Vec<T> {
    let Some(items) = payload.get(key).and_then(Value::as_array) else {
        warn!(what, key, "response carries no item array");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(what, error = %err, "skipping item that failed typed decode");
                None
            }
        })
        .collect()
}
