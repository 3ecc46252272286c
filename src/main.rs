use blitz::agents::MomentumAgent;
use blitz::client::{auth, Backoff, FrameSink, Session, WsTransport};
use blitz::config::AppConfig;
use blitz::domain::BlitzOptionConfig;
use blitz::env::TradingEnvironment;
use blitz::error::{BlitzError, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Liquid OTC instruments tried when no active is configured.
const PREFERRED_ACTIVE_IDS: [u32; 5] = [76, 1, 816, 1938, 2276];

#[derive(Parser)]
#[command(name = "blitz", about = "Event-driven blitz-option trading agent", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the momentum agent (default)
    Run {
        /// Instrument to trade, by id or name
        #[arg(long)]
        active: Option<String>,
    },
    /// List tradable blitz-option instruments
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config).map_err(BlitzError::from)?;
    init_logging(&config.logging.level);

    match cli.command {
        Some(Commands::List) => run_list(&config).await,
        Some(Commands::Run { active }) => run_agent_mode(&config, active).await,
        None => run_agent_mode(&config, None).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},tungstenite=warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Log in over HTTP, open the socket, authenticate the session and bring up
/// the environment.
async fn bootstrap(config: &AppConfig) -> Result<(Arc<WsTransport>, Arc<TradingEnvironment>)> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let credentials = auth::Credentials {
        email: config.account.email.clone(),
        password: config.account.password.clone(),
    };
    let ssid = auth::login(&http, &config.connection.login_url, &credentials).await?;
    info!("logged in");

    let backoff = Backoff::new(
        Duration::from_millis(config.connection.reconnect_base_ms),
        Duration::from_millis(config.connection.reconnect_max_ms),
    );
    let transport = WsTransport::with_backoff(config.connection.ws_url.clone(), backoff);
    transport.connect().await?;

    let session = Session::with_timeout(
        Arc::clone(&transport) as Arc<dyn FrameSink>,
        Duration::from_millis(config.connection.request_timeout_ms),
    );
    session.bind(&transport);
    auth::authenticate(&session, &ssid).await?;

    let environment = TradingEnvironment::new(session);
    environment.initialize().await?;
    Ok((transport, environment))
}

async fn run_agent_mode(config: &AppConfig, active_arg: Option<String>) -> Result<()> {
    let (transport, environment) = bootstrap(config).await?;

    let wanted = active_arg.or_else(|| config.trading.active.clone());
    let assets = environment.available_assets();
    let asset = find_asset(&assets, wanted.as_deref())?;
    info!(
        active_id = asset.active_id,
        name = %asset.name,
        payout = ?asset.payout_percent(),
        "trading instrument selected"
    );

    let mut agent = MomentumAgent::new(asset.active_id)
        .candle_size(config.trading.candle_size)
        .lookback(config.trading.lookback)
        .trade_amount(config.trading.amount)
        .expiration_size(config.trading.expiration_secs);

    tokio::select! {
        result = environment.run_agent(&mut agent) => result,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            transport.close();
            Ok(())
        }
    }
}

async fn run_list(config: &AppConfig) -> Result<()> {
    let (transport, environment) = bootstrap(config).await?;

    let rows: Vec<AssetRow> = environment.available_assets().iter().map(AssetRow::from).collect();
    println!("{}", Table::new(&rows));

    transport.close();
    Ok(())
}

#[derive(Tabled)]
struct AssetRow {
    #[tabled(rename = "id")]
    active_id: u32,
    name: String,
    description: String,
    #[tabled(rename = "payout %")]
    payout: String,
    #[tabled(rename = "min bet")]
    min_bet: String,
    #[tabled(rename = "expirations (s)")]
    expirations: String,
}

impl From<&BlitzOptionConfig> for AssetRow {
    fn from(config: &BlitzOptionConfig) -> Self {
        Self {
            active_id: config.active_id,
            name: config.name.clone(),
            description: config.description.clone(),
            payout: config
                .payout_percent()
                .map(|p| format!("{p:.0}"))
                .unwrap_or_else(|| "-".to_string()),
            min_bet: config.minimal_bet.to_string(),
            expirations: config
                .expiration_times
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Resolve the instrument to trade: by numeric id, exact or partial name
/// match, then the preferred list, then whatever is first in the catalog.
fn find_asset<'a>(
    assets: &'a [BlitzOptionConfig],
    wanted: Option<&str>,
) -> Result<&'a BlitzOptionConfig> {
    if let Some(wanted) = wanted {
        if let Ok(id) = wanted.parse::<u32>() {
            if let Some(asset) = assets.iter().find(|a| a.active_id == id) {
                return Ok(asset);
            }
        }
        let lowered = wanted.to_lowercase();
        if let Some(asset) = assets.iter().find(|a| a.name.to_lowercase() == lowered) {
            return Ok(asset);
        }
        if let Some(asset) = assets.iter().find(|a| a.name.to_lowercase().contains(&lowered)) {
            return Ok(asset);
        }
        return Err(BlitzError::Validation(format!(
            "no tradable instrument matches '{wanted}'"
        )));
    }

    PREFERRED_ACTIVE_IDS
        .iter()
        .find_map(|id| assets.iter().find(|a| a.active_id == *id))
        .or_else(|| assets.first())
        .ok_or_else(|| BlitzError::Validation("no tradable instruments available".to_string()))
}
