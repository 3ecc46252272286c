//! Agent-facing trading environment: sensors in, actions out.

pub mod actions;
pub mod environment;
pub mod sensors;
pub mod state;
pub mod types;

pub use environment::TradingEnvironment;
pub use sensors::SensorManager;
pub use state::EnvironmentState;
pub use types::{Action, Agent, EnvironmentRules, Observation, Query, Sensor, SensorValue};
