//! Command line front end: reads a JSON request with price history and writes the
//! optimization report as JSON to stdout.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use clap::Subcommand;
use portfolio_rs::portfolio::analyze_holdings;
use portfolio_rs::portfolio::asset_details;
use portfolio_rs::portfolio::Cancellation;
use portfolio_rs::portfolio::InMemoryPriceSource;
use portfolio_rs::portfolio::MarketDataSource;
use portfolio_rs::portfolio::OptimizationConfig;
use portfolio_rs::portfolio::PortfolioEngine;
use portfolio_rs::portfolio::PriceSeries;
use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portfolio")]
#[command(about = "Construct budget-feasible portfolios from historical prices")]
struct Cli {
  #[command(subcommand)]
  command: Command,

  /// Request file (JSON)
  #[arg(short, long, global = true, default_value = "request.json")]
  input: PathBuf,

  /// Pretty-print the JSON output
  #[arg(long, global = true)]
  pretty: bool,
}

#[derive(Subcommand)]
enum Command {
  /// Run the configured strategies and print the report
  Optimize {
    /// Abort the run after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
  },
  /// Evaluate the share counts in the request's `holdings`
  Holdings,
  /// Summarize the price history of one ticker
  Details {
    ticker: String,
  },
}

#[derive(Deserialize)]
struct Request {
  tickers: Vec<String>,
  series: HashMap<String, Vec<(NaiveDate, f64)>>,
  config: OptimizationConfig,
  #[serde(default)]
  holdings: HashMap<String, u64>,
}

impl Request {
  fn source(&self) -> InMemoryPriceSource {
    InMemoryPriceSource::new(
      self
        .series
        .iter()
        .map(|(ticker, obs)| PriceSeries::new(ticker.clone(), obs.clone())),
    )
  }
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  let raw = fs::read_to_string(&cli.input)
    .with_context(|| format!("failed to read {}", cli.input.display()))?;
  let request: Request = serde_json::from_str(&raw)
    .with_context(|| format!("failed to parse request {}", cli.input.display()))?;
  let source = request.source();

  match cli.command {
    Command::Optimize { timeout_ms } => {
      let cancel = match timeout_ms {
        Some(ms) => Cancellation::with_timeout(Duration::from_millis(ms)),
        None => Cancellation::new(),
      };
      let engine = PortfolioEngine::new(request.config);
      let report = engine
        .run_from_source(&source, &request.tickers, &cancel)
        .context("optimization failed")?;
      emit(&report, cli.pretty)
    }
    Command::Holdings => {
      let config = &request.config;
      let table = source
        .load_returns_and_prices(&request.tickers, config.granularity)
        .context("failed to build return statistics")?;
      let analysis = analyze_holdings(&table, &request.holdings, config.period_risk_free());
      if analysis.is_none() {
        tracing::warn!("no investable holdings in request");
      }
      emit(&analysis, cli.pretty)
    }
    Command::Details { ticker } => {
      let series = source
        .get(&ticker)
        .with_context(|| format!("no price history for {ticker}"))?;
      let details = asset_details(
        series,
        request.config.granularity,
        request.config.risk_free_rate,
      )?;
      emit(&details, cli.pretty)
    }
  }
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
  let out = if pretty {
    serde_json::to_string_pretty(value)?
  } else {
    serde_json::to_string(value)?
  };
  println!("{out}");
  Ok(())
}
