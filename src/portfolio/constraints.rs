//! # Portfolio Constraints
//!
//! $$
//! \mathcal{W} = \{\mathbf{w} : l_i \le w_i \le u_i,\ \textstyle\sum_i w_i = 1\}
//! $$
//!
//! Feasibility checks run once per request, per-asset bounds, projection onto the
//! bounded simplex and post-hoc cardinality reduction.

use tracing::warn;

use super::types::OptimizationConfig;
use crate::error::ConstraintRule;
use crate::error::PortfolioError;
use crate::error::Result;

const SUM_TOLERANCE: f64 = 1e-9;

/// Check every request-level rule before any strategy runs.
///
/// All requested strategies share this single verdict.
pub fn validate_constraints(tickers: &[String], config: &OptimizationConfig) -> Result<()> {
  if !config.budget.is_finite() || config.budget <= 0.0 {
    return Err(PortfolioError::InvalidConfig(format!(
      "budget must be positive, got {}",
      config.budget
    )));
  }
  if !config.risk_free_rate.is_finite() {
    return Err(PortfolioError::InvalidConfig(
      "risk-free rate must be finite".to_string(),
    ));
  }

  let sampling = &config.sampling;
  if !(sampling.cvar_confidence > 0.0 && sampling.cvar_confidence < 1.0) {
    return Err(PortfolioError::InvalidConfig(format!(
      "cvar confidence must lie in (0, 1), got {}",
      sampling.cvar_confidence
    )));
  }
  if sampling.monte_carlo_samples == 0
    || sampling.batch_monte_carlo_samples == 0
    || sampling.cvar_scenarios == 0
  {
    return Err(PortfolioError::InvalidConfig(
      "sample counts must be positive".to_string(),
    ));
  }

  if let Some(k) = config.max_assets {
    if k < 2 {
      return Err(PortfolioError::infeasible(
        ConstraintRule::MaxAssetsTooSmall,
        format!("max_assets = {k}"),
      ));
    }
  }

  for ticker in config.allocation_limits.keys() {
    if !tickers.contains(ticker) {
      warn!(ticker = ticker.as_str(), "allocation limit for ticker outside the universe is ignored");
    }
  }

  if config.allocation_limits.is_empty() {
    return Ok(());
  }

  let mut total_min = 0.0;
  let mut total_max = 0.0;
  for ticker in tickers {
    let limit = config.limit_for(ticker);
    let (lo, hi) = (limit.min_weight, limit.max_weight);
    if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) {
      return Err(PortfolioError::infeasible(
        ConstraintRule::MalformedBounds,
        format!("limits for {ticker} must lie in [0, 1], got [{lo}, {hi}]"),
      ));
    }
    if lo > hi {
      return Err(PortfolioError::infeasible(
        ConstraintRule::MalformedBounds,
        format!("min > max for {ticker}: {lo} > {hi}"),
      ));
    }
    total_min += lo;
    total_max += hi;
  }

  if total_min > 1.0 + SUM_TOLERANCE {
    return Err(PortfolioError::infeasible(
      ConstraintRule::MinimumsExceedOne,
      format!("minimum weights sum to {:.1}%", total_min * 100.0),
    ));
  }
  if total_max < 1.0 - SUM_TOLERANCE {
    return Err(PortfolioError::infeasible(
      ConstraintRule::MaximumsBelowOne,
      format!("maximum weights sum to {:.1}%", total_max * 100.0),
    ));
  }

  if let Some(k) = config.max_assets {
    let pinned = tickers
      .iter()
      .filter(|t| config.limit_for(t).min_weight > 0.0)
      .count();
    if pinned > k {
      warn!(pinned, max_assets = k, "cardinality reduction may zero assets with a minimum weight");
    }
  }

  Ok(())
}

/// Per-asset lower and upper weight bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct Bounds {
  pub lower: Vec<f64>,
  pub upper: Vec<f64>,
}

impl Bounds {
  /// Long-only `[0, 1]` bounds.
  pub fn unbounded(n: usize) -> Self {
    Self {
      lower: vec![0.0; n],
      upper: vec![1.0; n],
    }
  }

  pub fn from_config(tickers: &[String], config: &OptimizationConfig) -> Self {
    let (lower, upper) = tickers
      .iter()
      .map(|t| {
        let l = config.limit_for(t);
        (l.min_weight, l.max_weight)
      })
      .unzip();
    Self { lower, upper }
  }

  pub fn len(&self) -> usize {
    self.lower.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lower.is_empty()
  }

  pub fn contains(&self, w: &[f64], tol: f64) -> bool {
    w.iter()
      .enumerate()
      .all(|(i, &wi)| wi >= self.lower[i] - tol && wi <= self.upper[i] + tol)
  }

  /// Clip to the bounds and rescale to unit sum. Returns `None` for a zero total.
  pub fn clip_normalize(&self, w: &[f64]) -> Option<Vec<f64>> {
    let clipped: Vec<f64> = w
      .iter()
      .enumerate()
      .map(|(i, &wi)| wi.clamp(self.lower[i], self.upper[i]))
      .collect();
    let total: f64 = clipped.iter().sum();
    if total > 0.0 && total.is_finite() {
      Some(clipped.iter().map(|v| v / total).collect())
    } else {
      None
    }
  }
}

/// Euclidean projection onto $\{l \le w \le u, \sum w = 1\}$.
///
/// Solves $\sum_i \operatorname{clamp}(y_i - \tau, l_i, u_i) = 1$ for $\tau$ by bisection.
pub fn project_onto_bounded_simplex(y: &[f64], bounds: &Bounds) -> Vec<f64> {
  let n = y.len();
  if n == 0 {
    return Vec::new();
  }

  let sum_lo: f64 = bounds.lower.iter().sum();
  let sum_hi: f64 = bounds.upper.iter().sum();
  if sum_lo > 1.0 + SUM_TOLERANCE || sum_hi < 1.0 - SUM_TOLERANCE {
    return bounds
      .clip_normalize(y)
      .unwrap_or_else(|| vec![1.0 / n as f64; n]);
  }

  let shifted = |tau: f64| -> f64 {
    (0..n)
      .map(|i| (y[i] - tau).clamp(bounds.lower[i], bounds.upper[i]))
      .sum()
  };

  let mut lo = (0..n)
    .map(|i| y[i] - bounds.upper[i])
    .fold(f64::INFINITY, f64::min);
  let mut hi = (0..n)
    .map(|i| y[i] - bounds.lower[i])
    .fold(f64::NEG_INFINITY, f64::max);
  if !lo.is_finite() || !hi.is_finite() {
    return vec![1.0 / n as f64; n];
  }

  for _ in 0..200 {
    let mid = 0.5 * (lo + hi);
    if shifted(mid) > 1.0 {
      lo = mid;
    } else {
      hi = mid;
    }
    if hi - lo < 1e-15 {
      break;
    }
  }

  let tau = 0.5 * (lo + hi);
  (0..n)
    .map(|i| (y[i] - tau).clamp(bounds.lower[i], bounds.upper[i]))
    .collect()
}

/// Keep the `max_assets` largest weights by magnitude and renormalize.
///
/// Ties keep the earlier asset.
pub fn apply_max_assets(weights: &[f64], max_assets: usize) -> Vec<f64> {
  if max_assets >= weights.len() {
    return weights.to_vec();
  }

  let mut order: Vec<usize> = (0..weights.len()).collect();
  order.sort_by(|&a, &b| weights[b].abs().total_cmp(&weights[a].abs()));

  let mut out = vec![0.0; weights.len()];
  for &i in order.iter().take(max_assets) {
    out[i] = weights[i];
  }

  let total: f64 = out.iter().sum();
  if total > 0.0 {
    for w in &mut out {
      *w /= total;
    }
  }
  out
}
