//! # Random Portfolio Search
//!
//! $$
//! \mathbf{w} = \frac{\mathbf{e}}{\mathbf 1^\top \mathbf{e}},\quad e_i \overset{iid}{\sim}\operatorname{Exp}(1)
//! \ \Longrightarrow\ \mathbf{w}\sim\operatorname{Dirichlet}(\mathbf 1)
//! $$
//!
//! Seeded uniform sampling of the simplex for the Monte Carlo strategy and the
//! efficient-frontier scatter.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Exp1;
use serde::Serialize;

use super::cancel::Cancellation;
use super::data::portfolio_performance;
use super::optimizers::OptimizationProblem;
use super::optimizers::WeightSolution;
use crate::error::Result;

const CANCEL_STRIDE: usize = 256;

/// One random portfolio of the frontier scatter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrontierPoint {
  pub expected_return: f64,
  pub risk: f64,
  pub sharpe: f64,
}

fn sample_simplex(rng: &mut StdRng, out: &mut [f64]) {
  let mut total = 0.0;
  for w in out.iter_mut() {
    let e: f64 = Exp1.sample(rng);
    *w = e;
    total += e;
  }
  if total > 0.0 {
    for w in out.iter_mut() {
      *w /= total;
    }
  } else {
    let n = out.len() as f64;
    out.iter_mut().for_each(|w| *w = 1.0 / n);
  }
}

/// Best-Sharpe portfolio among `problem.monte_carlo_samples` simplex draws.
///
/// Draws are clipped to the allocation bounds and renormalized. Only a strictly
/// better Sharpe ratio replaces the incumbent, so the first draw wins ties.
pub fn optimize_monte_carlo(
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  let n = problem.n_assets();
  let mut rng = StdRng::seed_from_u64(problem.sampling.monte_carlo_seed);
  let mut draw = vec![0.0; n];
  let mut best: Option<(f64, Vec<f64>)> = None;

  for k in 0..problem.monte_carlo_samples {
    if k % CANCEL_STRIDE == 0 {
      cancel.check()?;
    }

    sample_simplex(&mut rng, &mut draw);
    let Some(w) = problem.bounds.clip_normalize(&draw) else {
      continue;
    };
    let (_, _, sharpe) = problem.performance(&w);

    match &best {
      Some((incumbent, _)) if sharpe <= *incumbent => {}
      _ => best = Some((sharpe, w)),
    }
  }

  let weights = match best {
    Some((_, w)) => w,
    None => vec![1.0 / n as f64; n],
  };

  Ok(WeightSolution {
    weights,
    diagnostics: None,
  })
}

/// Return/risk/Sharpe of `n_points` seeded random long-only portfolios.
pub fn sample_frontier(
  mu: &[f64],
  cov: &[Vec<f64>],
  risk_free: f64,
  n_points: usize,
  seed: u64,
  cancel: &Cancellation,
) -> Result<Vec<FrontierPoint>> {
  let mut rng = StdRng::seed_from_u64(seed);
  let mut w = vec![0.0; mu.len()];
  let mut points = Vec::with_capacity(n_points);

  for k in 0..n_points {
    if k % CANCEL_STRIDE == 0 {
      cancel.check()?;
    }
    sample_simplex(&mut rng, &mut w);
    let (expected_return, risk, sharpe) = portfolio_performance(&w, mu, cov, risk_free);
    points.push(FrontierPoint {
      expected_return,
      risk,
      sharpe,
    });
  }

  Ok(points)
}
