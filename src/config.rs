use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub account: AccountConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Login email for the broker account
    pub email: String,
    /// Account password
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the trading gateway
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// HTTP login endpoint
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Per-request deadline in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// First reconnect delay in milliseconds; doubles per failed attempt
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            login_url: default_login_url(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Instrument to trade; resolved against the catalog at startup
    #[serde(default)]
    pub active: Option<String>,
    /// Stake per option
    #[serde(default = "default_amount")]
    pub amount: Decimal,
    /// Option expiration in seconds
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    /// Candle size in seconds for the momentum signal
    #[serde(default = "default_candle_size")]
    pub candle_size: u32,
    /// Candles that must agree before trading
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            active: None,
            amount: default_amount(),
            expiration_secs: default_expiration_secs(),
            candle_size: default_candle_size(),
            lookback: default_lookback(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_ws_url() -> String {
    "wss://ws.iqoption.com/echo/websocket".to_string()
}

fn default_login_url() -> String {
    crate::client::auth::DEFAULT_LOGIN_URL.to_string()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_amount() -> Decimal {
    Decimal::from(30)
}

fn default_expiration_secs() -> u64 {
    60
}

fn default_candle_size() -> u32 {
    1
}

fn default_lookback() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Override with environment variables (BLITZ_ACCOUNT__EMAIL, etc.)
            .add_source(
                Environment::with_prefix("BLITZ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
