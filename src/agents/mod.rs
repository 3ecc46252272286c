//! Built-in trading agents.

pub mod momentum;

pub use momentum::MomentumAgent;
