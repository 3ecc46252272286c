pub mod agents;
pub mod api;
pub mod client;
pub mod config;
pub mod domain;
pub mod env;
pub mod error;

pub use agents::MomentumAgent;
pub use client::{Backoff, Frame, Session, WsTransport};
pub use config::AppConfig;
pub use env::{Action, Agent, Observation, Sensor, SensorValue, TradingEnvironment};
pub use error::{BlitzError, Result};
