//! # Integer Share Allocation
//!
//! $$
//! n_i^{(0)} = \left\lfloor \frac{w_i B}{p_i} \right\rfloor,\qquad
//! \sum_i n_i p_i \le B
//! $$
//!
//! Continuous weights to whole shares, followed by a greedy Sharpe-improving spend of
//! the remaining cash.

use super::cancel::Cancellation;
use super::data::portfolio_performance;
use super::optimizers::OptimizationProblem;
use super::types::PortfolioMetrics;
use crate::error::Result;

/// Upper bound on payback periods, also reported for holdings with no expected profit.
pub const PAYBACK_CAP: f64 = 9_999.0;

const MAX_REFINEMENT_STEPS: usize = 5_000;

fn invested(shares: &[u64], prices: &[f64]) -> f64 {
  shares
    .iter()
    .zip(prices.iter())
    .map(|(&n, &p)| n as f64 * p)
    .sum()
}

/// Share of invested value per asset; all zero for an empty holding.
pub fn realized_weights(shares: &[u64], prices: &[f64]) -> Vec<f64> {
  let total = invested(shares, prices);
  if total <= 0.0 {
    return vec![0.0; shares.len()];
  }
  shares
    .iter()
    .zip(prices.iter())
    .map(|(&n, &p)| n as f64 * p / total)
    .collect()
}

/// Metrics of a discrete holding; every value is recomputed from the inputs.
pub fn portfolio_metrics(
  shares: &[u64],
  prices: &[f64],
  mu: &[f64],
  cov: &[Vec<f64>],
  risk_free: f64,
) -> PortfolioMetrics {
  let total = invested(shares, prices);
  if total <= 0.0 {
    return PortfolioMetrics {
      payback_periods: PAYBACK_CAP,
      ..PortfolioMetrics::default()
    };
  }

  let w = realized_weights(shares, prices);
  let (ret, vol, sharpe) = portfolio_performance(&w, mu, cov, risk_free);
  let period_profit = ret * total;
  let payback_periods = if period_profit > 0.0 {
    (total / period_profit).min(PAYBACK_CAP)
  } else {
    PAYBACK_CAP
  };

  PortfolioMetrics {
    invested: total,
    period_profit,
    period_risk: vol * total,
    sharpe,
    payback_periods,
    return_pct: ret * 100.0,
  }
}

fn holding_sharpe(shares: &[u64], problem: &OptimizationProblem) -> f64 {
  let w = realized_weights(shares, &problem.prices);
  portfolio_performance(&w, &problem.mu, &problem.cov, problem.risk_free).2
}

/// Whole shares for `weights` under `problem.budget`.
///
/// Floors the target positions, then repeatedly buys the single affordable share with
/// the largest strictly positive Sharpe gain. Ties go to the earlier asset.
pub fn allocate_shares(
  weights: &[f64],
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<Vec<u64>> {
  let prices = &problem.prices;
  let budget = problem.budget;

  let total_weight: f64 = weights.iter().map(|w| w.max(0.0)).sum();
  let scale = if total_weight > 1.0 { 1.0 / total_weight } else { 1.0 };

  let mut shares: Vec<u64> = weights
    .iter()
    .zip(prices.iter())
    .map(|(&w, &p)| {
      let target = (w.max(0.0) * scale * budget / p).floor();
      if target.is_finite() && target > 0.0 {
        target as u64
      } else {
        0
      }
    })
    .collect();

  // Rounding can push the floored cost a hair above the budget.
  while invested(&shares, prices) > budget {
    let Some(i) = (0..shares.len())
      .filter(|&i| shares[i] > 0)
      .max_by(|&a, &b| prices[a].total_cmp(&prices[b]))
    else {
      break;
    };
    shares[i] -= 1;
  }

  let cheapest = prices.iter().copied().fold(f64::INFINITY, f64::min);
  for step in 0..MAX_REFINEMENT_STEPS {
    if step % 64 == 0 {
      cancel.check()?;
    }

    let remaining = budget - invested(&shares, prices);
    if remaining < cheapest {
      break;
    }

    let current = holding_sharpe(&shares, problem);
    let mut best: Option<(usize, f64)> = None;
    for i in 0..shares.len() {
      if prices[i] > remaining {
        continue;
      }
      shares[i] += 1;
      let gain = holding_sharpe(&shares, problem) - current;
      shares[i] -= 1;

      if gain > 0.0 && best.map_or(true, |(_, g)| gain > g) {
        best = Some((i, gain));
      }
    }

    match best {
      Some((i, _)) if invested(&shares, prices) + prices[i] <= budget => shares[i] += 1,
      _ => break,
    }
  }

  Ok(shares)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::constraints::Bounds;
  use crate::portfolio::optimizers::optimize_with_strategy;
  use crate::portfolio::optimizers::tests::three_asset_problem;
  use crate::portfolio::types::SamplingConfig;
  use crate::portfolio::types::Strategy;

  #[test]
  fn empty_holding_has_capped_payback() {
    let m = portfolio_metrics(&[0, 0], &[10.0, 20.0], &[0.01, 0.02], &vec![vec![0.0; 2]; 2], 0.0);
    assert_eq!(m.invested, 0.0);
    assert_eq!(m.payback_periods, PAYBACK_CAP);
  }

  #[test]
  fn metrics_are_derived_from_shares() {
    let cov = vec![vec![0.0004, 0.0], vec![0.0, 0.0009]];
    let m = portfolio_metrics(&[10, 5], &[100.0, 200.0], &[0.01, 0.02], &cov, 0.001);
    assert_abs_diff_eq!(m.invested, 2_000.0, epsilon = 1e-9);
    assert_abs_diff_eq!(m.period_profit, 30.0, epsilon = 1e-9);
    assert_abs_diff_eq!(m.return_pct, 1.5, epsilon = 1e-9);
    assert_abs_diff_eq!(m.payback_periods, 2_000.0 / 30.0, epsilon = 1e-9);
    let vol = (0.25 * 0.0004 + 0.25 * 0.0009_f64).sqrt();
    assert_abs_diff_eq!(m.period_risk, vol * 2_000.0, epsilon = 1e-9);
    assert_abs_diff_eq!(m.sharpe, (0.015 - 0.001) / vol, epsilon = 1e-9);
  }

  #[test]
  fn never_overspends() {
    let cancel = Cancellation::new();
    for budget in [37.0, 99.99, 310.0, 1_234.5, 10_000.0, 77_777.0] {
      for seed in [0_u64, 1, 42] {
        let mut problem = three_asset_problem();
        problem.budget = budget;
        problem.sampling.monte_carlo_seed = seed;
        problem.sampling.cvar_seed = seed;
        problem.monte_carlo_samples = 500;
        problem.sampling.cvar_scenarios = 500;

        for strategy in Strategy::ALL {
          let sol = optimize_with_strategy(strategy, &problem, &cancel).unwrap();
          let shares = allocate_shares(&sol.weights, &problem, &cancel).unwrap();
          let spent = invested(&shares, &problem.prices);
          assert!(spent <= budget, "{strategy} seed {seed}: {spent} > {budget}");
        }
      }
    }
  }

  #[test]
  fn oversized_weights_are_scaled_down() {
    let problem = three_asset_problem();
    let shares = allocate_shares(&[2.0, 2.0, 2.0], &problem, &Cancellation::new()).unwrap();
    assert!(invested(&shares, &problem.prices) <= problem.budget);
  }

  #[test]
  fn allocation_is_deterministic() {
    let problem = three_asset_problem();
    let cancel = Cancellation::new();
    let w = [0.25, 0.35, 0.40];
    assert_eq!(
      allocate_shares(&w, &problem, &cancel).unwrap(),
      allocate_shares(&w, &problem, &cancel).unwrap()
    );
  }

  #[test]
  fn refinement_does_not_lower_sharpe() {
    let problem = three_asset_problem();
    let w = [0.3, 0.3, 0.4];
    let floored: Vec<u64> = w
      .iter()
      .zip(problem.prices.iter())
      .map(|(w, p)| (w * problem.budget / p).floor() as u64)
      .collect();
    let refined = allocate_shares(&w, &problem, &Cancellation::new()).unwrap();
    assert!(holding_sharpe(&refined, &problem) >= holding_sharpe(&floored, &problem));
  }

  #[test]
  fn equal_gains_go_to_the_earlier_asset() {
    // AAA and BBB are interchangeable; CCC only dilutes the return.
    let problem = OptimizationProblem {
      tickers: vec!["AAA".into(), "BBB".into(), "CCC".into()],
      mu: vec![0.5, 0.5, 0.0],
      cov: vec![
        vec![0.25, 0.0, 0.0],
        vec![0.0, 0.25, 0.0],
        vec![0.0, 0.0, 0.25],
      ],
      prices: vec![1.0, 1.0, 1.0],
      bounds: Bounds::unbounded(3),
      risk_free: 0.0,
      budget: 5.0,
      max_assets: None,
      sampling: SamplingConfig::default(),
      monte_carlo_samples: 100,
    };

    let shares = allocate_shares(&[0.25, 0.25, 0.5], &problem, &Cancellation::new()).unwrap();
    assert_eq!(shares, vec![2, 1, 2]);
  }
}
