//! FOREX.com Streaming Smoke Test CLI
//!
//! Commands:
//! - `prices`: Stream price ticks of one market
//! - `orders`: Stream order updates of the account
//! - `account`: Log in and print account info
//!
//! # Usage
//! ```bash
//! FOREXCOM_USERNAME=... FOREXCOM_PASSWORD=... FOREXCOM_APP_KEY=...
//!
//! # Price stream, 100 ticks or until Ctrl+C
//! fx_smoke prices --symbol EUR/USD --limit 100 --out data/prices.jsonl
//!
//! # Order updates
//! fx_smoke orders --limit 0
//!
//! # Account ids
//! fx_smoke account
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use forexcom_adapter::lightstream::SessionState;
use forexcom_adapter::{ClientConfig, Credentials, ForexClient, REST_API_BASE, STREAM_API_BASE};

#[derive(Parser)]
#[command(name = "fx_smoke")]
#[command(about = "FOREX.com streaming smoke test CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Trading API base URL
    #[arg(long, default_value = REST_API_BASE, global = true)]
    rest_url: String,

    /// Push server base URL
    #[arg(long, default_value = STREAM_API_BASE, global = true)]
    stream_url: String,

    /// Proxy for plain HTTP requests
    #[arg(long, global = true)]
    http_proxy: Option<String>,

    /// Proxy for HTTPS requests
    #[arg(long, global = true)]
    https_proxy: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream price ticks of a market
    Prices {
        /// Market name, e.g. EUR/USD
        #[arg(long)]
        symbol: String,

        /// Maximum ticks to collect (0 = unlimited until Ctrl+C)
        #[arg(long, default_value = "100")]
        limit: u64,

        /// Optional JSONL output file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Stream order updates of the account
    Orders {
        /// Maximum updates to collect (0 = unlimited until Ctrl+C)
        #[arg(long, default_value = "0")]
        limit: u64,

        /// Optional JSONL output file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Log in and print account info
    Account,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let credentials = load_credentials()?;
    let config = ClientConfig::default()
        .with_rest_url(cli.rest_url)
        .with_stream_url(cli.stream_url)
        .with_proxies(cli.http_proxy, cli.https_proxy);
    info!("Trading API: {}", config.rest_url);
    info!("Push server: {}", config.stream_url);
    if let Some(proxy) = config.https_proxy.as_ref().or(config.http_proxy.as_ref()) {
        info!("Proxy: {}", proxy);
    }

    let client = ForexClient::with_config(credentials, config)?;

    match cli.command {
        Commands::Prices { symbol, limit, out } => run_prices(&client, symbol, limit, out).await,
        Commands::Orders { limit, out } => run_orders(&client, limit, out).await,
        Commands::Account => run_account(&client).await,
    }
}

fn load_credentials() -> Result<Credentials> {
    let credentials = match Credentials::from_env() {
        Some(c) => c,
        None => {
            error!("Missing credentials. Set environment variables:");
            error!("  FOREXCOM_USERNAME");
            error!("  FOREXCOM_PASSWORD");
            error!("  FOREXCOM_APP_KEY");
            anyhow::bail!("Missing credentials");
        }
    };

    if !credentials.is_valid() {
        error!("Invalid credentials - one or more fields are empty");
        anyhow::bail!("Invalid credentials");
    }

    info!("Credentials loaded: {:?}", credentials);
    Ok(credentials)
}

async fn run_prices(
    client: &ForexClient,
    symbol: String,
    limit: u64,
    out: Option<PathBuf>,
) -> Result<()> {
    info!("=== Price Stream Smoke Test ===");
    info!("Symbol: {}", symbol);
    info!("Limit: {} (0 = unlimited)", limit);
    info!("Press Ctrl+C to stop");
    info!("");

    client.connect().await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let index = client
        .price_symbol_subscribe(&symbol, move |price| {
            let _ = tx.send(price.clone());
        })
        .await?;
    info!("Listening as {}", index);

    let received = collect(client, rx, limit, out, |price| info!("{}", price)).await;

    client.disconnect().await?;
    summarize(received?);
    Ok(())
}

async fn run_orders(client: &ForexClient, limit: u64, out: Option<PathBuf>) -> Result<()> {
    info!("=== Orders Stream Smoke Test ===");
    info!("Limit: {} (0 = unlimited)", limit);
    info!("Press Ctrl+C to stop");
    info!("");

    client.connect().await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let index = client
        .orders_subscribe(move |order| {
            let _ = tx.send(order.clone());
        })
        .await?;
    info!("Listening as {}", index);

    let received = collect(client, rx, limit, out, |order| info!("{}", order)).await;

    client.disconnect().await?;
    summarize(received?);
    Ok(())
}

async fn run_account(client: &ForexClient) -> Result<()> {
    info!("=== Account Info ===");

    client.rest().login().await?;
    let account = client.get_account_info().await?;

    info!("Client account id: {}", account.client_account_id);
    for trading in &account.trading_accounts {
        info!("Trading account id: {}", trading.trading_account_id);
    }
    println!("{}", serde_json::to_string_pretty(&account)?);
    Ok(())
}

/// Drain records until the limit, Ctrl+C or the end of the stream
async fn collect<T: Serialize>(
    client: &ForexClient,
    mut rx: mpsc::UnboundedReceiver<T>,
    limit: u64,
    out: Option<PathBuf>,
    show: impl Fn(&T),
) -> Result<u64> {
    let mut file = match &out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            Some(tokio::fs::File::create(path).await?)
        }
        None => None,
    };

    let mut status = client.streamer().watch_status();
    let mut received = 0u64;

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                show(&record);
                if let Some(file) = file.as_mut() {
                    let mut line = serde_json::to_string(&record)?;
                    line.push('\n');
                    file.write_all(line.as_bytes()).await?;
                }
                received += 1;
                if limit > 0 && received >= limit {
                    info!("Limit reached");
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() || status.borrow().state == SessionState::Disconnected {
                    warn!("Stream ended: {:?}", status.borrow().termination);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(mut file) = file {
        file.flush().await?;
        if let Some(path) = out {
            info!("Output written to: {}", path.display());
        }
    }
    Ok(received)
}

fn summarize(received: u64) {
    info!("");
    info!("=== Summary ===");
    info!("Records received: {}", received);
}
