//! Bracket sizer
//!
//! Sizes long equity swing trades against a dollar risk budget and a
//! per-position capital allocation, then submits the result as a bracket
//! order (stop-buy entry, limit take-profit, stop-loss).

mod api;
mod models;
mod trading;

use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{
    drain_events, place_bracket, GatewayEvent, OrderGateway, PaperGateway, PortalConfig,
    PortalGateway, PriceHistoryProvider, YahooClient,
};
use crate::models::{Candidate, OrderSide, PriceSeries, RiskParameters, SizingResult};
use crate::trading::{PositionSizer, SizerConfig};

/// Risk-budgeted position sizing and bracket orders.
#[derive(Parser)]
#[command(name = "bracketsizer")]
#[command(about = "Size equity swing trades and place bracket orders", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON file overriding the default sizer settings
    #[arg(short, long, env = "BRACKETSIZER_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file holding the paper broker's working orders between runs
    #[arg(long, env = "BRACKETSIZER_PAPER_BOOK", default_value = "bracketsizer-paper.json")]
    paper_book: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entry, stop-loss and take-profit candidates and the resulting size
    Size {
        #[command(flatten)]
        sizing: SizingArgs,
    },

    /// Size a trade and submit it as a bracket order
    Place {
        #[command(flatten)]
        sizing: SizingArgs,

        /// Route to the IBKR Client Portal instead of the paper broker
        #[arg(long)]
        live: bool,
    },

    /// Show the average true range for a symbol
    Atr {
        /// Ticker symbol
        symbol: String,

        /// ATR period in sessions
        #[arg(short, long, default_value = "21")]
        period: usize,

        /// Calendar days of history to fetch
        #[arg(long, default_value = "30")]
        lookback_days: i64,
    },

    /// List positions held at the IBKR Client Portal
    Positions,

    /// List working orders
    Orders {
        /// Query the IBKR Client Portal instead of the paper broker
        #[arg(long)]
        live: bool,
    },

    /// Show the effective sizer configuration
    Config,
}

#[derive(Args)]
struct SizingArgs {
    /// Ticker symbol
    symbol: String,

    /// Account capital in USD
    #[arg(short, long)]
    capital: Decimal,

    /// Risk per position, percent of capital
    #[arg(short, long)]
    risk_per_position: Decimal,

    /// Total portfolio risk, percent of capital
    #[arg(short, long)]
    total_risk: Decimal,

    /// Number of positions the capital is split across
    #[arg(short, long)]
    positions: u32,

    /// Cap on a single position's value, percent of capital
    #[arg(long, default_value = "20")]
    max_position_pct: Decimal,

    /// Calendar days of history to fetch
    #[arg(long, default_value = "30")]
    lookback_days: i64,

    /// Entry candidate to use (1-based, as listed)
    #[arg(long, default_value = "1")]
    entry: usize,

    /// Stop-loss candidate to use (1-based, as listed)
    #[arg(long, default_value = "1")]
    stop: usize,

    /// Take-profit candidate to use (1-based, as listed)
    #[arg(long, default_value = "1")]
    target: usize,

    /// Override the ATR period
    #[arg(long)]
    atr_period: Option<usize>,

    /// Override the ATR stop multiplier
    #[arg(long)]
    atr_multiplier: Option<Decimal>,

    /// Add an SMA stop-loss candidate with this period
    #[arg(long)]
    sma_stop: Option<usize>,
}

impl SizingArgs {
    fn risk_parameters(&self) -> Result<RiskParameters> {
        let risk = RiskParameters::new(
            self.capital,
            self.risk_per_position,
            self.total_risk,
            self.positions,
        )?
        .with_max_position_pct(self.max_position_pct)?;
        Ok(risk)
    }

    fn apply_overrides(&self, mut config: SizerConfig) -> SizerConfig {
        if let Some(period) = self.atr_period {
            config.atr_period = period;
        }
        if let Some(multiplier) = self.atr_multiplier {
            config.atr_multiplier = multiplier;
        }
        if self.sma_stop.is_some() {
            config.sma_stop_period = self.sma_stop;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => SizerConfig::from_file(path)?,
        None => SizerConfig::default(),
    };

    match cli.command {
        Commands::Size { sizing } => {
            let sizer = PositionSizer::new(sizing.apply_overrides(config))?;
            let (_, result) = size_trade(&sizer, &sizing).await?;
            print_result(&result);
        }

        Commands::Place { sizing, live } => {
            let sizer = PositionSizer::new(sizing.apply_overrides(config))?;
            let (series, result) = size_trade(&sizer, &sizing).await?;
            print_result(&result);

            if result.share_count == 0 {
                println!("\nRisk budget allows no whole shares; nothing to submit.");
                return Ok(());
            }

            let tick = sizer.config().price_tick;
            if live {
                let (gateway, mut rx) = PortalGateway::connect(PortalConfig::from_env()?).await?;
                submit(&gateway, &mut rx, series.symbol(), &result, tick).await?;
            } else {
                let (gateway, mut rx) = PaperGateway::open(&cli.paper_book)?;
                submit(&gateway, &mut rx, series.symbol(), &result, tick).await?;
            }
        }

        Commands::Atr {
            symbol,
            period,
            lookback_days,
        } => {
            let series = fetch(&symbol, lookback_days).await?;
            let sizer = PositionSizer::new(config)?;
            let atr = sizer.average_true_range(&series, period)?;

            println!(
                "\n{} ATR({}) over {} sessions: {}",
                series.symbol(),
                period,
                series.len(),
                atr.round_dp(4)
            );
            println!("Last close: {}", series.last().close);
        }

        Commands::Positions => {
            // The paper broker never fills, so positions only exist live
            let (gateway, mut rx) = PortalGateway::connect(PortalConfig::from_env()?).await?;
            gateway.request_positions().await?;
            print_events(&mut rx);
        }

        Commands::Orders { live } => {
            if live {
                let (gateway, mut rx) = PortalGateway::connect(PortalConfig::from_env()?).await?;
                gateway.request_open_orders().await?;
                print_events(&mut rx);
            } else {
                let (gateway, mut rx) = PaperGateway::open(&cli.paper_book)?;
                gateway.request_open_orders().await?;
                print_events(&mut rx);
            }
        }

        Commands::Config => {
            println!("\n=== Sizer Configuration ===\n");
            println!("Entry:");
            println!("  Premium over last high: {}%", config.entry_premium_pct * dec!(100));
            println!("  Average-close windows:  {:?}", config.average_close_windows);

            println!("\nStop-Loss:");
            println!("  ATR Period:             {}", config.atr_period);
            println!("  ATR Multiplier:         {}", config.atr_multiplier);
            println!("  Lowest-Low Window:      {}", config.lowest_low_window);
            println!("  Percentage:             {}%", config.stop_loss_pct * dec!(100));
            println!(
                "  SMA Period:             {}",
                config
                    .sma_stop_period
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "off".to_string())
            );

            println!("\nTake-Profit:");
            println!(
                "  Reward/Risk Ratios:     {}",
                config
                    .reward_risk_ratios
                    .iter()
                    .map(|r| format!("{}:1", r))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!(
                "  Percentage:             {}",
                config
                    .take_profit_pct
                    .map(|p| format!("{}%", p * dec!(100)))
                    .unwrap_or_else(|| "off".to_string())
            );

            println!("\nOrders:");
            println!("  Price Tick:             {}", config.price_tick);

            println!("\n{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn fetch(symbol: &str, lookback_days: i64) -> Result<PriceSeries> {
    if lookback_days <= 0 {
        return Err(anyhow!("lookback must be at least one day"));
    }

    let client = YahooClient::new()?;
    let series = client
        .fetch_series(symbol, chrono::Duration::days(lookback_days))
        .await?;
    Ok(series)
}

/// Fetch history, list every candidate, and size the selected combination.
async fn size_trade(
    sizer: &PositionSizer,
    args: &SizingArgs,
) -> Result<(PriceSeries, SizingResult)> {
    let risk = args.risk_parameters()?;
    let series = fetch(&args.symbol, args.lookback_days).await?;

    info!(
        symbol = %series.symbol(),
        sessions = series.len(),
        last_close = %series.last().close,
        "Loaded price history"
    );

    println!(
        "\n=== {} ({} sessions, last close {}) ===",
        series.symbol(),
        series.len(),
        series.last().close
    );

    let entries = sizer.entry_candidates(&series)?;
    print_candidates("Entry", &entries);
    let entry = pick(&entries, args.entry, "entry")?;

    let stops = sizer.stop_loss_candidates(&series, entry.price)?;
    print_candidates("Stop-loss", &stops);
    let stop = pick(&stops, args.stop, "stop-loss")?;

    let targets = sizer.take_profit_candidates(entry.price, stop.price)?;
    print_candidates("Take-profit", &targets);
    let target = pick(&targets, args.target, "take-profit")?;

    let result = sizer.size(entry.price, stop.price, target.policy, &risk)?;
    Ok((series, result))
}

async fn submit<G: OrderGateway>(
    gateway: &G,
    rx: &mut UnboundedReceiver<GatewayEvent>,
    symbol: &str,
    result: &SizingResult,
    tick: Decimal,
) -> Result<()> {
    let bracket = place_bracket(gateway, symbol, OrderSide::Buy, result, tick).await?;

    println!("\n--- Bracket {} ---", bracket.parent_id());
    for leg in bracket.legs() {
        println!(
            "  #{:<12} {:<12} {:<4} {} {} @ {}{}",
            leg.order_id,
            leg.role.to_string(),
            leg.action.as_str(),
            leg.quantity,
            leg.order_type.as_str(),
            leg.price().map(|p| p.to_string()).unwrap_or_default(),
            leg.oca_group
                .as_ref()
                .map(|g| format!(" ({})", g))
                .unwrap_or_default()
        );
    }

    print_events(rx);
    Ok(())
}

fn pick<'a, P>(
    candidates: &'a [Candidate<P>],
    choice: usize,
    label: &str,
) -> Result<&'a Candidate<P>> {
    let candidate = choice
        .checked_sub(1)
        .and_then(|i| candidates.get(i))
        .ok_or_else(|| {
            anyhow!(
                "{} choice {} out of range (1-{})",
                label,
                choice,
                candidates.len()
            )
        })?;

    if let Some(reason) = &candidate.invalid_reason {
        return Err(anyhow!("{} candidate {} is not usable: {}", label, choice, reason));
    }

    Ok(candidate)
}

fn print_candidates<P: Display>(title: &str, candidates: &[Candidate<P>]) {
    println!("\n{} candidates:", title);
    println!("  {:>2}  {:<22} {:>12}  {}", "#", "POLICY", "PRICE", "NOTE");
    for (i, c) in candidates.iter().enumerate() {
        println!(
            "  {:>2}  {:<22} {:>12}  {}",
            i + 1,
            truncate(&c.policy.to_string(), 22),
            c.price.round_dp(2),
            c.invalid_reason.as_deref().unwrap_or("")
        );
    }
}

fn print_result(result: &SizingResult) {
    println!("\n--- Sizing ---");
    println!("Entry:          {}", result.entry_price.round_dp(2));
    println!(
        "Stop-Loss:      {} (-{:.2}%)",
        result.stop_loss_price.round_dp(2),
        result.stop_loss_pct()
    );
    println!(
        "Take-Profit:    {} (+{:.2}%)",
        result.take_profit_price.round_dp(2),
        result.take_profit_pct()
    );
    println!("Shares:         {}", result.share_count);
    println!("  Risk cap:     {:.2}", result.risk_cap_shares);
    println!("  Capital cap:  {:.2}", result.capital_cap_shares);
    println!("  Bound by:     {}", result.binding);
    println!("Position Value: ${:.2}", result.position_value());
    println!("Dollar Risk:    ${:.2}", result.risk_dollars());
}

fn print_events(rx: &mut UnboundedReceiver<GatewayEvent>) {
    let events = drain_events(rx);
    if events.is_empty() {
        return;
    }

    println!("\n--- Gateway ---");
    for event in events {
        println!("  {}", event);
    }
}

/// Truncate a string for display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
