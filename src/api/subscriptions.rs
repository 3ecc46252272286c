//! Sentiment and instrument-list streams.

use crate::client::Session;
use crate::domain::{Decoded, TradersMood};
use crate::error::Result;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct SubscriptionsApi {
    session: Arc<Session>,
}

impl SubscriptionsApi {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Current traders mood for an asset, the 0..1 share of call buyers.
    /// Falls back to the neutral 0.5 when the payload is malformed.
    pub async fn get_traders_mood(&self, active_id: u32) -> Result<f64> {
        let frame = self
            .session
            .call(
                "get-traders-mood",
                "1.0",
                json!({ "asset_id": active_id, "instrument": "turbo-option" }),
            )
            .await?;
        Ok(
            match Decoded::<TradersMood>::from_value("traders-mood", frame.msg.clone()) {
                Decoded::Valid(mood) => mood.value,
                Decoded::Raw(raw) => raw.get("value").and_then(Value::as_f64).unwrap_or(0.5),
            },
        )
    }

    /// Subscribe to mood updates for one asset. Events for other assets on
    /// the same stream are ignored.
    pub async fn subscribe_traders_mood(
        &self,
        active_id: u32,
        handler: impl Fn(f64) + Send + Sync + 'static,
    ) -> Result<()> {
        self.session.on("traders-mood-changed", move |frame| {
            let Some(mood) =
                Decoded::<TradersMood>::from_value("traders-mood-changed", frame.msg.clone()).valid()
            else {
                return;
            };
            if mood.asset_id == active_id {
                handler(mood.value);
            }
        });

        self.session
            .subscribe(
                "traders-mood-changed",
                None,
                Some(json!({ "asset_id": active_id, "instrument_type": "turbo-option" })),
            )
            .await
    }

    /// Asset online/offline changes, delivered raw.
    pub async fn subscribe_instruments_list(
        &self,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<()> {
        self.session.on("instruments-list", move |frame| handler(&frame.msg));
        self.session.subscribe("instruments-list", None, None).await
    }
}
