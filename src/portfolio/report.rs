//! # Portfolio Report
//!
//! $$
//! \text{best} = \arg\max_{s} \ \mathrm{SR}\big(\mathbf{n}^{(s)}\big)
//! $$
//!
//! Aggregation of strategy results with per-asset statistics, the dependence matrices
//! and the frontier sample, plus standalone holdings and single-asset analytics.

use std::collections::HashMap;

use chrono::NaiveDate;
use impl_new_derive::ImplNew;
use serde::Serialize;

use super::allocation::portfolio_metrics;
use super::allocation::realized_weights;
use super::data::corr_from_cov;
use super::data::sample_mean;
use super::data::sample_std;
use super::data::sharpe_ratio;
use super::data::simple_returns_series;
use super::data::Granularity;
use super::data::PriceSeries;
use super::data::ReturnsTable;
use super::monte_carlo::FrontierPoint;
use super::types::PortfolioMetrics;
use super::types::PortfolioResult;
use super::types::Strategy;
use super::types::StrategyFailure;
use crate::error::PortfolioError;
use crate::error::Result;

/// Observations back used for the recent change of [`AssetDetails`].
const CHANGE_LOOKBACK: usize = 22;
/// Period-end prices kept in [`AssetDetails::history`].
const HISTORY_PERIODS: usize = 24;

/// Square matrix with row and column labels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabeledMatrix {
  pub labels: Vec<String>,
  pub values: Vec<Vec<f64>>,
}

/// Per-period statistics of one asset at its latest price.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssetStatistics {
  pub ticker: String,
  pub price: f64,
  pub mean_return: f64,
  pub std_return: f64,
  pub sharpe: f64,
  /// Expected profit per share and period.
  pub abs_profit: f64,
  /// Profit standard deviation per share and period.
  pub abs_risk: f64,
}

/// Statistics for every asset of `table`.
pub fn asset_statistics(table: &ReturnsTable, risk_free: f64) -> Vec<AssetStatistics> {
  table
    .tickers()
    .iter()
    .zip(table.returns().iter())
    .zip(table.latest_prices().iter())
    .map(|((ticker, col), &price)| {
      let mean_return = sample_mean(col);
      let std_return = sample_std(col);
      AssetStatistics {
        ticker: ticker.clone(),
        price,
        mean_return,
        std_return,
        sharpe: sharpe_ratio(mean_return, std_return, risk_free),
        abs_profit: mean_return * price,
        abs_risk: std_return * price,
      }
    })
    .collect()
}

/// Everything a request produces.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationReport {
  /// Tickers the strategies were run on, in request order.
  pub tickers_used: Vec<String>,
  /// Requested tickers left out for lack of data, with none silently lost.
  pub dropped_tickers: Vec<String>,
  /// One result per successful strategy, in canonical strategy order.
  pub portfolios: Vec<PortfolioResult>,
  pub best_strategy: Option<Strategy>,
  pub failures: Vec<StrategyFailure>,
  pub frontier: Vec<FrontierPoint>,
  pub asset_stats: Vec<AssetStatistics>,
  pub correlation: LabeledMatrix,
  pub covariance: LabeledMatrix,
}

impl OptimizationReport {
  pub(crate) fn assemble(
    table: &ReturnsTable,
    dropped_tickers: Vec<String>,
    portfolios: Vec<PortfolioResult>,
    failures: Vec<StrategyFailure>,
    frontier: Vec<FrontierPoint>,
    risk_free: f64,
  ) -> Self {
    let labels = table.tickers().to_vec();
    let covariance = table.covariance_matrix();
    let correlation = corr_from_cov(&covariance);

    Self {
      tickers_used: labels.clone(),
      dropped_tickers,
      best_strategy: best_strategy(&portfolios),
      portfolios,
      failures,
      frontier,
      asset_stats: asset_statistics(table, risk_free),
      correlation: LabeledMatrix {
        labels: labels.clone(),
        values: correlation,
      },
      covariance: LabeledMatrix {
        labels,
        values: covariance,
      },
    }
  }

  /// Result of the best strategy, if any ran.
  pub fn best(&self) -> Option<&PortfolioResult> {
    let strategy = self.best_strategy?;
    self.portfolios.iter().find(|p| p.strategy() == strategy)
  }

  pub fn portfolio(&self, strategy: Strategy) -> Option<&PortfolioResult> {
    self.portfolios.iter().find(|p| p.strategy() == strategy)
  }
}

/// Highest Sharpe ratio; the earlier strategy wins ties.
pub fn best_strategy(portfolios: &[PortfolioResult]) -> Option<Strategy> {
  let mut best: Option<&PortfolioResult> = None;
  for p in portfolios {
    match best {
      Some(b) if p.metrics().sharpe <= b.metrics().sharpe => {}
      _ => best = Some(p),
    }
  }
  best.map(PortfolioResult::strategy)
}

/// Metrics of a user-entered holding.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HoldingsAnalysis {
  pub tickers: Vec<String>,
  pub shares: Vec<u64>,
  pub weights: Vec<f64>,
  pub metrics: PortfolioMetrics,
}

/// Analyze share counts against `table`.
///
/// Only tickers with data and a positive quantity count. Returns `None` when nothing
/// is investable.
pub fn analyze_holdings(
  table: &ReturnsTable,
  quantities: &HashMap<String, u64>,
  risk_free: f64,
) -> Option<HoldingsAnalysis> {
  let held: Vec<String> = table
    .tickers()
    .iter()
    .filter(|t| quantities.get(*t).copied().unwrap_or(0) > 0)
    .cloned()
    .collect();
  if held.is_empty() {
    return None;
  }

  let (sub, _) = table.select(&held);
  if sub.n_assets() == 0 {
    return None;
  }
  let shares: Vec<u64> = sub
    .tickers()
    .iter()
    .map(|t| quantities.get(t).copied().unwrap_or(0))
    .collect();

  let metrics = portfolio_metrics(
    &shares,
    sub.latest_prices(),
    &sub.mean_vector(),
    &sub.covariance_matrix(),
    risk_free,
  );
  if metrics.invested <= 0.0 {
    return None;
  }

  Some(HoldingsAnalysis {
    weights: realized_weights(&shares, sub.latest_prices()),
    tickers: sub.tickers().to_vec(),
    shares,
    metrics,
  })
}

/// One period-end close.
#[derive(ImplNew, Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PricePoint {
  pub date: NaiveDate,
  pub close: f64,
}

/// Summary of a single asset's history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssetDetails {
  pub ticker: String,
  pub current_price: f64,
  pub max_price: f64,
  /// Percent change against the close 22 observations back, or the previous close for
  /// shorter series.
  pub change_pct: f64,
  pub mean_return: f64,
  pub std_return: f64,
  pub sharpe: f64,
  /// Last close of each of the most recent 24 periods.
  pub history: Vec<PricePoint>,
}

pub fn asset_details(
  series: &PriceSeries,
  granularity: Granularity,
  risk_free_annual: f64,
) -> Result<AssetDetails> {
  let obs = series.observations();
  let Some(&(_, current_price)) = obs.last() else {
    return Err(PortfolioError::insufficient(
      Vec::new(),
      vec![series.ticker().to_string()],
      "empty price series",
    ));
  };
  let max_price = obs.iter().map(|(_, c)| *c).fold(f64::NEG_INFINITY, f64::max);

  let change_pct = if obs.len() >= CHANGE_LOOKBACK {
    let prev = obs[obs.len() - CHANGE_LOOKBACK].1;
    (current_price - prev) / prev * 100.0
  } else if obs.len() >= 2 {
    let prev = obs[obs.len() - 2].1;
    (current_price - prev) / prev * 100.0
  } else {
    0.0
  };

  let mut period_ends: Vec<PricePoint> = Vec::new();
  for &(date, close) in obs {
    match period_ends.last_mut() {
      Some(last) if granularity.period_of(last.date) == granularity.period_of(date) => {
        *last = PricePoint::new(date, close);
      }
      _ => period_ends.push(PricePoint::new(date, close)),
    }
  }

  let closes: Vec<f64> = period_ends.iter().map(|p| p.close).collect();
  let returns = simple_returns_series(&closes);
  let mean_return = sample_mean(&returns);
  let std_return = sample_std(&returns);
  let sharpe = sharpe_ratio(
    mean_return,
    std_return,
    risk_free_annual / granularity.periods_per_year(),
  );

  let skip = period_ends.len().saturating_sub(HISTORY_PERIODS);
  let history = period_ends.split_off(skip);

  Ok(AssetDetails {
    ticker: series.ticker().to_string(),
    current_price,
    max_price,
    change_pct,
    mean_return,
    std_return,
    sharpe,
    history,
  })
}
