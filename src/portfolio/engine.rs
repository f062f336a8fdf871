//! # Portfolio Engine
//!
//! $$
//! \{\mathbf{n}^{(s)}\}_{s\in S} = \operatorname{Allocate}\big(\operatorname{Optimize}_s(\mu, \Sigma, \mathcal W), B\big)
//! $$
//!
//! Request orchestration: validation, parallel strategy runs, share allocation and
//! report assembly.

use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::allocation::allocate_shares;
use super::allocation::portfolio_metrics;
use super::allocation::realized_weights;
use super::cancel::Cancellation;
use super::constraints::apply_max_assets;
use super::constraints::validate_constraints;
use super::data::MarketDataSource;
use super::data::MIN_OBSERVATIONS;
use super::data::ReturnsTable;
use super::monte_carlo::sample_frontier;
use super::monte_carlo::FrontierPoint;
use super::optimizers::optimize_with_strategy;
use super::optimizers::OptimizationProblem;
use super::report::OptimizationReport;
use super::types::OptimizationConfig;
use super::types::PortfolioResult;
use super::types::Strategy;
use super::types::StrategyFailure;
use crate::error::PortfolioError;
use crate::error::Result;

/// Single entry point for portfolio construction requests.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  config: OptimizationConfig,
}

impl PortfolioEngine {
  pub fn new(config: OptimizationConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &OptimizationConfig {
    &self.config
  }

  /// Load data for `tickers` from `source`, then run [`Self::run_optimization`].
  pub fn run_from_source(
    &self,
    source: &dyn MarketDataSource,
    tickers: &[String],
    cancel: &Cancellation,
  ) -> Result<OptimizationReport> {
    let table = source.load_returns_and_prices(tickers, self.config.granularity)?;
    self.run_optimization(tickers, &table, cancel)
  }

  /// Run every selected strategy over `tickers` and assemble the report.
  ///
  /// Feasibility is decided once, before any strategy starts. A failing strategy is
  /// skipped and listed in [`OptimizationReport::failures`]; cancellation aborts the
  /// whole request.
  pub fn run_optimization(
    &self,
    tickers: &[String],
    table: &ReturnsTable,
    cancel: &Cancellation,
  ) -> Result<OptimizationReport> {
    let (table, missing) = table.select(tickers);
    let mut dropped: Vec<String> = table
      .excluded()
      .iter()
      .filter(|t| tickers.contains(t))
      .cloned()
      .collect();
    for t in missing {
      if !dropped.contains(&t) {
        dropped.push(t);
      }
    }
    if !dropped.is_empty() {
      warn!(dropped = ?dropped, "tickers without usable data were dropped");
    }

    if table.n_assets() < 2 {
      return Err(PortfolioError::insufficient(
        table.tickers().to_vec(),
        dropped,
        "at least two assets with usable data are required",
      ));
    }
    if table.n_observations() < MIN_OBSERVATIONS {
      return Err(PortfolioError::insufficient(
        table.tickers().to_vec(),
        dropped,
        format!(
          "only {} aligned return observations",
          table.n_observations()
        ),
      ));
    }

    validate_constraints(table.tickers(), &self.config)?;

    let strategies = self.config.strategies.resolve(self.config.experience);
    let problem = OptimizationProblem::from_table(&table, &self.config);
    info!(
      assets = problem.n_assets(),
      observations = table.n_observations(),
      strategies = strategies.len(),
      budget = problem.budget,
      "starting optimization"
    );

    let (outcomes, frontier) = rayon::join(
      || run_strategies(&strategies, |strategy| self.run_strategy(strategy, &problem, cancel)),
      || self.frontier(&problem, cancel),
    );
    let settled = settle_outcomes(outcomes);
    let frontier = frontier?;
    cancel.check()?;
    let (portfolios, failures) = settled?;

    let report = OptimizationReport::assemble(
      &table,
      dropped,
      portfolios,
      failures,
      frontier,
      problem.risk_free,
    );
    info!(
      portfolios = report.portfolios.len(),
      failures = report.failures.len(),
      best = ?report.best_strategy,
      "optimization finished"
    );

    Ok(report)
  }

  fn frontier(
    &self,
    problem: &OptimizationProblem,
    cancel: &Cancellation,
  ) -> Result<Vec<FrontierPoint>> {
    sample_frontier(
      &problem.mu,
      &problem.cov,
      problem.risk_free,
      self.config.sampling.frontier_samples,
      self.config.sampling.frontier_seed,
      cancel,
    )
  }

  fn run_strategy(
    &self,
    strategy: Strategy,
    problem: &OptimizationProblem,
    cancel: &Cancellation,
  ) -> Result<PortfolioResult> {
    cancel.check()?;
    let solution = optimize_with_strategy(strategy, problem, cancel)?;

    let mut target = solution.weights;
    if strategy.honours_limits() {
      if let Some(k) = problem.max_assets {
        target = apply_max_assets(&target, k);
      }
    }
    if target.iter().any(|w| !w.is_finite()) {
      return Err(PortfolioError::StrategyFailed {
        strategy,
        reason: "solver produced non-finite weights".to_string(),
      });
    }

    let shares = allocate_shares(&target, problem, cancel)?;
    let metrics = portfolio_metrics(
      &shares,
      &problem.prices,
      &problem.mu,
      &problem.cov,
      problem.risk_free,
    );
    debug!(
      %strategy,
      invested = metrics.invested,
      sharpe = metrics.sharpe,
      "strategy allocated"
    );

    let weights = realized_weights(&shares, &problem.prices);
    Ok(PortfolioResult::new(
      strategy,
      problem.tickers.clone(),
      shares,
      weights,
      target,
      metrics,
      solution.diagnostics,
    ))
  }
}

/// Run `run` for every strategy in parallel, keeping the input order.
fn run_strategies<F>(strategies: &[Strategy], run: F) -> Vec<(Strategy, Result<PortfolioResult>)>
where
  F: Fn(Strategy) -> Result<PortfolioResult> + Sync,
{
  strategies
    .par_iter()
    .map(|&strategy| (strategy, run(strategy)))
    .collect()
}

/// Apply the failure policy to per-strategy outcomes.
///
/// Any cancellation aborts the request. Other errors skip their strategy and are
/// listed as failures. When nothing succeeded the request fails with
/// [`PortfolioError::NoStrategySucceeded`].
fn settle_outcomes(
  outcomes: Vec<(Strategy, Result<PortfolioResult>)>,
) -> Result<(Vec<PortfolioResult>, Vec<StrategyFailure>)> {
  let mut portfolios = Vec::with_capacity(outcomes.len());
  let mut failures = Vec::new();
  for (strategy, outcome) in outcomes {
    match outcome {
      Ok(result) => portfolios.push(result),
      Err(PortfolioError::Cancelled) => return Err(PortfolioError::Cancelled),
      Err(err) => {
        warn!(%strategy, error = %err, "strategy skipped");
        failures.push(StrategyFailure {
          strategy,
          reason: err.to_string(),
        });
      }
    }
  }

  if portfolios.is_empty() {
    return Err(PortfolioError::NoStrategySucceeded(failures));
  }
  Ok((portfolios, failures))
}
