//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Strategy selection, request configuration and result containers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use impl_new_derive::ImplNew;
use serde::Deserialize;
use serde::Serialize;

use super::data::Granularity;
use crate::error::PortfolioError;

/// Closed set of weight construction strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Strategy {
  /// Maximum risk-adjusted return (tangency portfolio).
  #[serde(rename = "max_sharpe")]
  MaxSharpe,
  /// Minimum portfolio variance.
  #[serde(rename = "min_volatility")]
  MinVolatility,
  /// Equalized marginal risk contributions.
  #[serde(rename = "risk_parity")]
  RiskParity,
  /// Minimum expected tail loss over simulated scenarios.
  #[serde(rename = "min_cvar")]
  MinCVaR,
  /// Best Sharpe ratio among random simplex draws.
  #[serde(rename = "monte_carlo")]
  MonteCarlo,
  /// Uniform weights, optionally on the best `k` assets.
  #[serde(rename = "equal_weight")]
  EqualWeight,
}

impl Strategy {
  /// Every strategy in execution and report order.
  pub const ALL: [Strategy; 6] = [
    Strategy::MaxSharpe,
    Strategy::MinVolatility,
    Strategy::RiskParity,
    Strategy::MinCVaR,
    Strategy::MonteCarlo,
    Strategy::EqualWeight,
  ];

  /// Human readable name.
  pub fn name(&self) -> &'static str {
    match self {
      Strategy::MaxSharpe => "Max Sharpe",
      Strategy::MinVolatility => "Min Volatility",
      Strategy::RiskParity => "Risk Parity",
      Strategy::MinCVaR => "Min CVaR",
      Strategy::MonteCarlo => "Monte Carlo",
      Strategy::EqualWeight => "Equal Weight",
    }
  }

  /// Whether per-asset allocation limits and post-hoc cardinality apply.
  pub fn honours_limits(&self) -> bool {
    !matches!(self, Strategy::EqualWeight)
  }

  fn rank(&self) -> usize {
    Strategy::ALL
      .iter()
      .position(|s| s == self)
      .unwrap_or(Strategy::ALL.len())
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

impl FromStr for Strategy {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace(['-', ' '], "_").as_str() {
      "max_sharpe" | "sharpe" | "tangency" => Ok(Self::MaxSharpe),
      "min_volatility" | "min_vol" | "min_variance" => Ok(Self::MinVolatility),
      "risk_parity" | "riskparity" | "erc" => Ok(Self::RiskParity),
      "min_cvar" | "cvar" | "mincvar" => Ok(Self::MinCVaR),
      "monte_carlo" | "montecarlo" | "mc" => Ok(Self::MonteCarlo),
      "equal_weight" | "equal" | "1/n" => Ok(Self::EqualWeight),
      other => Err(PortfolioError::InvalidConfig(format!(
        "unknown strategy '{other}'"
      ))),
    }
  }
}

/// Which strategies a request runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySelection {
  /// Every strategy permitted for the caller's experience level.
  All,
  /// An explicit list; duplicates are ignored and order is normalized.
  Only(Vec<Strategy>),
}

impl Default for StrategySelection {
  fn default() -> Self {
    Self::Only(vec![Strategy::MaxSharpe])
  }
}

impl StrategySelection {
  /// Strategies to run, in canonical order, after experience gating.
  ///
  /// A list that contains nothing the caller may run falls back to
  /// [`Strategy::MaxSharpe`].
  pub fn resolve(&self, experience: ExperienceLevel) -> Vec<Strategy> {
    let mut picked: Vec<Strategy> = match self {
      StrategySelection::All => Strategy::ALL.to_vec(),
      StrategySelection::Only(list) => list.clone(),
    };
    picked.retain(|s| experience.permits(*s));
    picked.sort_by_key(Strategy::rank);
    picked.dedup();

    if picked.is_empty() {
      vec![Strategy::MaxSharpe]
    } else {
      picked
    }
  }

  pub fn is_all(&self) -> bool {
    matches!(self, StrategySelection::All)
  }
}

/// Caller sophistication; limits the strategy menu.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
  /// Equal weight and max Sharpe only.
  Beginner,
  #[default]
  Professional,
}

impl ExperienceLevel {
  pub fn permits(&self, strategy: Strategy) -> bool {
    match self {
      ExperienceLevel::Beginner => {
        matches!(strategy, Strategy::EqualWeight | Strategy::MaxSharpe)
      }
      ExperienceLevel::Professional => true,
    }
  }
}

/// Per-asset weight bounds. Absence of a limit means `[0, 1]`.
#[derive(ImplNew, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationLimit {
  #[serde(alias = "min", default)]
  pub min_weight: f64,
  #[serde(alias = "max", default = "one")]
  pub max_weight: f64,
}

fn one() -> f64 {
  1.0
}

impl Default for AllocationLimit {
  fn default() -> Self {
    Self {
      min_weight: 0.0,
      max_weight: 1.0,
    }
  }
}

/// Sample counts, confidence level and seeds for every randomized component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
  /// Simplex draws for a standalone Monte Carlo run.
  pub monte_carlo_samples: usize,
  /// Simplex draws for Monte Carlo when every strategy is requested.
  pub batch_monte_carlo_samples: usize,
  /// Points in the efficient-frontier scatter.
  pub frontier_samples: usize,
  /// Multivariate normal scenarios for min-CVaR.
  pub cvar_scenarios: usize,
  /// CVaR confidence; the tail is the worst `1 - confidence` share.
  pub cvar_confidence: f64,
  pub monte_carlo_seed: u64,
  pub frontier_seed: u64,
  pub cvar_seed: u64,
}

impl Default for SamplingConfig {
  fn default() -> Self {
    Self {
      monte_carlo_samples: 10_000,
      batch_monte_carlo_samples: 3_000,
      frontier_samples: 2_000,
      cvar_scenarios: 10_000,
      cvar_confidence: 0.95,
      monte_carlo_seed: 42,
      frontier_seed: 0,
      cvar_seed: 42,
    }
  }
}

/// Request configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationConfig {
  /// Hard spending ceiling in currency units.
  pub budget: f64,
  /// Annual risk-free rate; converted per period via [`Granularity::periods_per_year`].
  #[serde(default = "default_risk_free")]
  pub risk_free_rate: f64,
  #[serde(default)]
  pub strategies: StrategySelection,
  #[serde(default)]
  pub experience: ExperienceLevel,
  /// Maximum number of assets with a non-zero weight.
  #[serde(default)]
  pub max_assets: Option<usize>,
  #[serde(default)]
  pub allocation_limits: HashMap<String, AllocationLimit>,
  #[serde(default)]
  pub granularity: Granularity,
  #[serde(default)]
  pub sampling: SamplingConfig,
}

fn default_risk_free() -> f64 {
  0.02
}

impl OptimizationConfig {
  /// Defaults for everything except the budget.
  pub fn new(budget: f64) -> Self {
    Self {
      budget,
      risk_free_rate: default_risk_free(),
      strategies: StrategySelection::default(),
      experience: ExperienceLevel::default(),
      max_assets: None,
      allocation_limits: HashMap::new(),
      granularity: Granularity::default(),
      sampling: SamplingConfig::default(),
    }
  }

  /// Risk-free rate for one return period of the configured granularity.
  pub fn period_risk_free(&self) -> f64 {
    self.risk_free_rate / self.granularity.periods_per_year()
  }

  /// Limit for `ticker`, defaulting to `[0, 1]`.
  pub fn limit_for(&self, ticker: &str) -> AllocationLimit {
    self
      .allocation_limits
      .get(ticker)
      .copied()
      .unwrap_or_default()
  }
}

/// Metrics of a discrete holding, all per return period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
  /// Currency actually spent on shares.
  pub invested: f64,
  /// Expected profit per period in currency.
  pub period_profit: f64,
  /// Standard deviation of the period profit in currency.
  pub period_risk: f64,
  pub sharpe: f64,
  /// Periods until cumulative expected profit equals the invested amount (capped).
  pub payback_periods: f64,
  /// Expected period return in percent.
  pub return_pct: f64,
}

/// Convergence information for numerically solved strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverDiagnostics {
  pub iterations: u64,
  pub converged: bool,
}

/// Output of a single strategy run. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioResult {
  strategy: Strategy,
  name: &'static str,
  tickers: Vec<String>,
  shares: Vec<u64>,
  weights: Vec<f64>,
  target_weights: Vec<f64>,
  metrics: PortfolioMetrics,
  diagnostics: Option<SolverDiagnostics>,
}

impl PortfolioResult {
  pub(crate) fn new(
    strategy: Strategy,
    tickers: Vec<String>,
    shares: Vec<u64>,
    weights: Vec<f64>,
    target_weights: Vec<f64>,
    metrics: PortfolioMetrics,
    diagnostics: Option<SolverDiagnostics>,
  ) -> Self {
    Self {
      strategy,
      name: strategy.name(),
      tickers,
      shares,
      weights,
      target_weights,
      metrics,
      diagnostics,
    }
  }

  pub fn strategy(&self) -> Strategy {
    self.strategy
  }

  pub fn name(&self) -> &str {
    self.name
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Whole shares per asset, aligned with [`Self::tickers`].
  pub fn shares(&self) -> &[u64] {
    &self.shares
  }

  /// Realized weights of the invested amount.
  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  /// Continuous weights the strategy produced before share rounding.
  pub fn target_weights(&self) -> &[f64] {
    &self.target_weights
  }

  pub fn metrics(&self) -> &PortfolioMetrics {
    &self.metrics
  }

  pub fn diagnostics(&self) -> Option<SolverDiagnostics> {
    self.diagnostics
  }
}

/// A strategy that was skipped, with the reason.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StrategyFailure {
  pub strategy: Strategy,
  pub reason: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn beginner_selection_is_gated() {
    let all = StrategySelection::All.resolve(ExperienceLevel::Beginner);
    assert_eq!(all, vec![Strategy::MaxSharpe, Strategy::EqualWeight]);

    let only_cvar = StrategySelection::Only(vec![Strategy::MinCVaR]);
    assert_eq!(
      only_cvar.resolve(ExperienceLevel::Beginner),
      vec![Strategy::MaxSharpe]
    );
  }

  #[test]
  fn explicit_selection_is_deduplicated_in_canonical_order() {
    let sel = StrategySelection::Only(vec![
      Strategy::EqualWeight,
      Strategy::MaxSharpe,
      Strategy::EqualWeight,
    ]);
    assert_eq!(
      sel.resolve(ExperienceLevel::Professional),
      vec![Strategy::MaxSharpe, Strategy::EqualWeight]
    );
  }

  #[test]
  fn strategy_parses_common_aliases() {
    assert_eq!("min-cvar".parse::<Strategy>().ok(), Some(Strategy::MinCVaR));
    assert_eq!("Max Sharpe".parse::<Strategy>().ok(), Some(Strategy::MaxSharpe));
    assert!("markowitz-ls".parse::<Strategy>().is_err());
  }

  #[test]
  fn config_deserializes_with_defaults() {
    let cfg: OptimizationConfig = serde_json::from_str(
      r#"{"budget": 5000, "allocation_limits": {"AAA": {"min": 0.1}}, "strategies": "all"}"#,
    )
    .unwrap();

    assert_eq!(cfg.budget, 5000.0);
    assert_eq!(cfg.strategies, StrategySelection::All);
    assert_eq!(cfg.limit_for("AAA"), AllocationLimit::new(0.1, 1.0));
    assert_eq!(cfg.limit_for("BBB"), AllocationLimit::default());
    assert!((cfg.period_risk_free() - 0.02 / 12.0).abs() < 1e-15);
  }
}
