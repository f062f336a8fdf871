//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}\in\mathcal W} \ \mathcal{L}(\mathbf{w}),\qquad
//! \mathcal W = \{l \le \mathbf{w} \le u,\ \mathbf 1^\top\mathbf{w}=1\}
//! $$
//!
//! Continuous weight optimizers. Non-convex objectives are minimized with Nelder-Mead
//! over an unconstrained parameter mapped onto $\mathcal W$ by Euclidean projection;
//! minimum variance is solved as a QP by projected gradient descent.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::core::TerminationReason;
use argmin::core::TerminationStatus;
use argmin::solver::neldermead::NelderMead;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::StandardNormal;
use tracing::debug;
use tracing::warn;

use super::cancel::Cancellation;
use super::constraints::project_onto_bounded_simplex;
use super::constraints::Bounds;
use super::data::dot;
use super::data::mat_vec_mul;
use super::data::portfolio_variance;
use super::data::sharpe_ratio;
use super::data::ReturnsTable;
use super::monte_carlo::optimize_monte_carlo;
use super::types::OptimizationConfig;
use super::types::SamplingConfig;
use super::types::SolverDiagnostics;
use super::types::Strategy;
use crate::error::PortfolioError;
use crate::error::Result;

const PROJECTION_PENALTY: f64 = 1.0;
const SIMPLEX_STEP: f64 = 0.2;
const INFEASIBLE_COST: f64 = 1e10;
const QP_MAX_ITERS: usize = 5_000;
const QP_TOLERANCE: f64 = 1e-12;

/// Read-only inputs shared by every strategy of a request.
#[derive(Clone, Debug)]
pub struct OptimizationProblem {
  pub tickers: Vec<String>,
  /// Mean period returns.
  pub mu: Vec<f64>,
  pub cov: Vec<Vec<f64>>,
  pub prices: Vec<f64>,
  pub bounds: Bounds,
  /// Risk-free rate per return period.
  pub risk_free: f64,
  pub budget: f64,
  pub max_assets: Option<usize>,
  pub sampling: SamplingConfig,
  /// Simplex draws for the Monte Carlo strategy in this request.
  pub monte_carlo_samples: usize,
}

impl OptimizationProblem {
  /// Derive the shared inputs of a request from an aligned table.
  pub fn from_table(table: &ReturnsTable, config: &OptimizationConfig) -> Self {
    let monte_carlo_samples = if config.strategies.is_all() {
      config.sampling.batch_monte_carlo_samples
    } else {
      config.sampling.monte_carlo_samples
    };

    Self {
      tickers: table.tickers().to_vec(),
      mu: table.mean_vector(),
      cov: table.covariance_matrix(),
      prices: table.latest_prices().to_vec(),
      bounds: Bounds::from_config(table.tickers(), config),
      risk_free: config.period_risk_free(),
      budget: config.budget,
      max_assets: config.max_assets,
      sampling: config.sampling.clone(),
      monte_carlo_samples,
    }
  }

  pub fn n_assets(&self) -> usize {
    self.mu.len()
  }

  /// Expected return, volatility and Sharpe ratio of `w`.
  pub fn performance(&self, w: &[f64]) -> (f64, f64, f64) {
    let ret = dot(w, &self.mu);
    let vol = portfolio_variance(w, &self.cov).sqrt();
    (ret, vol, sharpe_ratio(ret, vol, self.risk_free))
  }
}

/// Continuous weights and, for iterative solvers, how the solve ended.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightSolution {
  pub weights: Vec<f64>,
  pub diagnostics: Option<SolverDiagnostics>,
}

impl WeightSolution {
  fn closed_form(weights: Vec<f64>) -> Self {
    Self {
      weights,
      diagnostics: None,
    }
  }
}

fn equal_weights(n: usize) -> Vec<f64> {
  vec![1.0 / n as f64; n]
}

fn asset_vol(cov: &[Vec<f64>], i: usize) -> f64 {
  cov
    .get(i)
    .and_then(|row| row.get(i))
    .copied()
    .unwrap_or(0.0)
    .max(0.0)
    .sqrt()
}

/// Objective evaluated on the projection of an unconstrained parameter.
struct ProjectedCost<F> {
  objective: F,
  bounds: Bounds,
  cancel: Cancellation,
}

impl<F> CostFunction for ProjectedCost<F>
where
  F: Fn(&[f64]) -> f64,
{
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    // A flat cost lets the solver stop on its own; the caller reports the cancellation.
    if self.cancel.is_cancelled() {
      return Ok(INFEASIBLE_COST);
    }

    let w = project_onto_bounded_simplex(x, &self.bounds);
    let dist2: f64 = x.iter().zip(w.iter()).map(|(a, b)| (a - b).powi(2)).sum();
    let value = (self.objective)(w.as_slice());

    if value.is_finite() {
      Ok(value + PROJECTION_PENALTY * dist2)
    } else {
      Ok(INFEASIBLE_COST)
    }
  }
}

/// Nelder-Mead from the projected equal-weight point. The last best iterate is
/// accepted whether or not the solver converged.
fn solve_projected<F>(
  strategy: Strategy,
  objective: F,
  bounds: &Bounds,
  max_iters: u64,
  sd_tolerance: f64,
  cancel: &Cancellation,
) -> Result<WeightSolution>
where
  F: Fn(&[f64]) -> f64,
{
  let n = bounds.len();
  let x0 = project_onto_bounded_simplex(&equal_weights(n), bounds);

  let mut simplex = Vec::with_capacity(n + 1);
  simplex.push(x0.clone());
  for i in 0..n {
    let mut point = x0.clone();
    point[i] += SIMPLEX_STEP;
    simplex.push(point);
  }

  cancel.check()?;
  let cost = ProjectedCost {
    objective,
    bounds: bounds.clone(),
    cancel: cancel.clone(),
  };

  let outcome = NelderMead::new(simplex)
    .with_sd_tolerance(sd_tolerance)
    .and_then(|solver| {
      Executor::new(cost, solver)
        .configure(|state| state.max_iters(max_iters))
        .run()
    });
  cancel.check()?;

  let (best_x, diagnostics) = match outcome {
    Ok(res) => {
      let converged = matches!(
        res.state.termination_status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
      );
      let diagnostics = SolverDiagnostics {
        iterations: res.state.iter,
        converged,
      };
      (res.state.best_param.unwrap_or_else(|| x0.clone()), diagnostics)
    }
    Err(err) => {
      warn!(%strategy, error = %err, "solver failed, keeping the starting point");
      (
        x0.clone(),
        SolverDiagnostics {
          iterations: 0,
          converged: false,
        },
      )
    }
  };

  if diagnostics.converged {
    debug!(%strategy, iterations = diagnostics.iterations, "solver converged");
  } else {
    warn!(%strategy, iterations = diagnostics.iterations, "solver did not converge, using last iterate");
  }

  Ok(WeightSolution {
    weights: project_onto_bounded_simplex(&best_x, bounds),
    diagnostics: Some(diagnostics),
  })
}

/// Maximum Sharpe ratio: minimize the negated Sharpe ratio.
pub fn optimize_max_sharpe(
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  let mu = problem.mu.clone();
  let cov = problem.cov.clone();
  let rf = problem.risk_free;

  solve_projected(
    Strategy::MaxSharpe,
    move |w| {
      let ret = dot(w, &mu);
      let vol = portfolio_variance(w, &cov).sqrt();
      -sharpe_ratio(ret, vol, rf)
    },
    &problem.bounds,
    2_000,
    1e-10,
    cancel,
  )
}

/// Minimum variance by projected gradient descent with step $1/L$, $L = 2\lVert\Sigma\rVert_F$.
///
/// Monotone from the equal-weight start, so never worse than equal weight.
pub fn optimize_min_volatility(
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  let n = problem.n_assets();
  let bounds = &problem.bounds;
  let mut w = project_onto_bounded_simplex(&equal_weights(n), bounds);

  let frobenius: f64 = problem
    .cov
    .iter()
    .flat_map(|row| row.iter())
    .map(|v| v * v)
    .sum::<f64>()
    .sqrt();
  let lipschitz = 2.0 * frobenius;
  if !(lipschitz > 0.0 && lipschitz.is_finite()) {
    return Ok(WeightSolution {
      weights: w,
      diagnostics: Some(SolverDiagnostics {
        iterations: 0,
        converged: true,
      }),
    });
  }
  let step = 1.0 / lipschitz;

  let mut iterations = 0;
  let mut converged = false;
  while iterations < QP_MAX_ITERS {
    if iterations % 64 == 0 {
      cancel.check()?;
    }
    iterations += 1;

    let grad = mat_vec_mul(&problem.cov, &w);
    let y: Vec<f64> = w
      .iter()
      .zip(grad.iter())
      .map(|(wi, gi)| wi - step * 2.0 * gi)
      .collect();
    let next = project_onto_bounded_simplex(&y, bounds);
    let delta = next
      .iter()
      .zip(w.iter())
      .map(|(a, b)| (a - b).abs())
      .fold(0.0, f64::max);
    w = next;

    if delta < QP_TOLERANCE {
      converged = true;
      break;
    }
  }

  if !converged {
    warn!(iterations, "min-volatility QP hit its iteration cap, using last iterate");
  }

  Ok(WeightSolution {
    weights: w,
    diagnostics: Some(SolverDiagnostics {
      iterations: iterations as u64,
      converged,
    }),
  })
}

/// Equal risk contribution: squared deviation of each asset's variance share from $1/n$.
pub fn optimize_risk_parity(
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  let cov = problem.cov.clone();
  let n = problem.n_assets();

  solve_projected(
    Strategy::RiskParity,
    move |w| {
      let sigma_w = mat_vec_mul(&cov, w);
      let port_var = dot(w, &sigma_w);
      if port_var < 1e-30 {
        return INFEASIBLE_COST;
      }

      let target_rc = 1.0 / n as f64;
      (0..n)
        .map(|i| (w[i] * sigma_w[i] / port_var - target_rc).powi(2))
        .sum()
    },
    &problem.bounds,
    5_000,
    1e-12,
    cancel,
  )
}

/// Minimum CVaR over seeded multivariate normal scenarios.
pub fn optimize_min_cvar(
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  let sampling = &problem.sampling;
  let scenarios = simulate_scenarios(
    &problem.mu,
    &problem.cov,
    sampling.cvar_scenarios,
    sampling.cvar_seed,
    cancel,
  )?;
  let tail = 1.0 - sampling.cvar_confidence;

  solve_projected(
    Strategy::MinCVaR,
    move |w| {
      let mut port: Vec<f64> = scenarios.iter().map(|s| dot(s, w)).collect();
      empirical_cvar(&mut port, tail)
    },
    &problem.bounds,
    1_000,
    1e-10,
    cancel,
  )
}

/// Uniform weights, or $1/k$ on the `max_assets` assets with the best return/volatility ratio.
pub fn optimize_equal_weight(mu: &[f64], cov: &[Vec<f64>], max_assets: Option<usize>) -> Vec<f64> {
  let n = mu.len();
  if n == 0 {
    return Vec::new();
  }

  let k = match max_assets {
    Some(k) if k < n => k,
    _ => return equal_weights(n),
  };

  let ratios: Vec<f64> = (0..n)
    .map(|i| {
      let vol = asset_vol(cov, i);
      if vol > 1e-15 {
        mu[i] / vol
      } else {
        0.0
      }
    })
    .collect();

  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&a, &b| ratios[b].total_cmp(&ratios[a]));

  let mut w = vec![0.0; n];
  for &i in order.iter().take(k) {
    w[i] = 1.0 / k as f64;
  }
  w
}

/// Return scenarios $\mu + L z$ with $LL^\top = \Sigma$ and seeded standard normals $z$.
pub fn simulate_scenarios(
  mu: &[f64],
  cov: &[Vec<f64>],
  n_scenarios: usize,
  seed: u64,
  cancel: &Cancellation,
) -> Result<Vec<Vec<f64>>> {
  let n = mu.len();
  let sigma = DMatrix::from_fn(n, n, |i, j| cov[i][j]);
  let l = cholesky_lower_with_jitter(sigma);
  let mut rng = StdRng::seed_from_u64(seed);
  let mut z = vec![0.0_f64; n];

  let mut scenarios = Vec::with_capacity(n_scenarios);
  for k in 0..n_scenarios {
    if k % 1024 == 0 {
      cancel.check()?;
    }
    for zi in z.iter_mut() {
      *zi = StandardNormal.sample(&mut rng);
    }
    let row: Vec<f64> = (0..n)
      .map(|i| mu[i] + (0..=i).map(|j| l[(i, j)] * z[j]).sum::<f64>())
      .collect();
    scenarios.push(row);
  }

  Ok(scenarios)
}

fn cholesky_lower_with_jitter(mut sigma: DMatrix<f64>) -> DMatrix<f64> {
  let dim = sigma.nrows();
  let mut jitter = 1e-12;
  for _ in 0..8 {
    if let Some(chol) = sigma.clone().cholesky() {
      return chol.l();
    }
    for i in 0..dim {
      sigma[(i, i)] += jitter;
    }
    jitter *= 10.0;
  }

  warn!(dim, "covariance is not positive definite, dropping correlations for scenarios");
  let mut l = DMatrix::<f64>::zeros(dim, dim);
  for i in 0..dim {
    l[(i, i)] = sigma[(i, i)].max(0.0).sqrt();
  }
  l
}

/// Mean loss over the worst `alpha` share of outcomes.
pub fn empirical_cvar(returns: &mut [f64], alpha: f64) -> f64 {
  if returns.is_empty() {
    return 0.0;
  }

  let cutoff = ((returns.len() as f64) * alpha.clamp(0.0, 1.0)).ceil() as usize;
  let cutoff = cutoff.max(1).min(returns.len());
  returns.select_nth_unstable_by(cutoff - 1, f64::total_cmp);
  let tail_mean: f64 = returns[..cutoff].iter().sum::<f64>() / cutoff as f64;

  -tail_mean
}

/// Dispatch to the selected strategy's weight construction.
pub fn optimize_with_strategy(
  strategy: Strategy,
  problem: &OptimizationProblem,
  cancel: &Cancellation,
) -> Result<WeightSolution> {
  if problem.n_assets() == 0 {
    return Err(PortfolioError::StrategyFailed {
      strategy,
      reason: "empty asset universe".to_string(),
    });
  }

  match strategy {
    Strategy::MaxSharpe => optimize_max_sharpe(problem, cancel),
    Strategy::MinVolatility => optimize_min_volatility(problem, cancel),
    Strategy::RiskParity => optimize_risk_parity(problem, cancel),
    Strategy::MinCVaR => optimize_min_cvar(problem, cancel),
    Strategy::MonteCarlo => optimize_monte_carlo(problem, cancel),
    Strategy::EqualWeight => Ok(WeightSolution::closed_form(optimize_equal_weight(
      &problem.mu,
      &problem.cov,
      problem.max_assets,
    ))),
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  pub(crate) fn three_asset_problem() -> OptimizationProblem {
    OptimizationProblem {
      tickers: vec!["AAA".into(), "BBB".into(), "CCC".into()],
      mu: vec![0.010, 0.006, 0.012],
      cov: vec![
        vec![0.0025, 0.0005, 0.0002],
        vec![0.0005, 0.0016, 0.0004],
        vec![0.0002, 0.0004, 0.0049],
      ],
      prices: vec![120.0, 45.0, 310.0],
      bounds: Bounds::unbounded(3),
      risk_free: 0.02 / 12.0,
      budget: 10_000.0,
      max_assets: None,
      sampling: SamplingConfig {
        cvar_scenarios: 2_000,
        ..SamplingConfig::default()
      },
      monte_carlo_samples: 2_000,
    }
  }

  #[test]
  fn numeric_strategies_sum_to_one() {
    let problem = three_asset_problem();
    let cancel = Cancellation::new();
    for strategy in Strategy::ALL {
      let sol = optimize_with_strategy(strategy, &problem, &cancel).unwrap();
      assert_abs_diff_eq!(sol.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
      assert!(sol.weights.iter().all(|w| *w >= -1e-12), "{strategy}: {:?}", sol.weights);
    }
  }

  #[test]
  fn equal_weight_is_uniform() {
    let problem = three_asset_problem();
    let w = optimize_equal_weight(&problem.mu, &problem.cov, None);
    for wi in w {
      assert_abs_diff_eq!(wi, 1.0 / 3.0, epsilon = 1e-15);
    }
  }

  #[test]
  fn equal_weight_with_cardinality_picks_best_ratios() {
    let problem = three_asset_problem();
    // ratios: 0.2, 0.15, 0.1714...
    let w = optimize_equal_weight(&problem.mu, &problem.cov, Some(2));
    assert_eq!(w, vec![0.5, 0.0, 0.5]);
  }

  #[test]
  fn min_volatility_beats_equal_weight() {
    let problem = three_asset_problem();
    let sol = optimize_min_volatility(&problem, &Cancellation::new()).unwrap();
    let ew = optimize_equal_weight(&problem.mu, &problem.cov, None);
    assert!(portfolio_variance(&sol.weights, &problem.cov) <= portfolio_variance(&ew, &problem.cov) + 1e-15);
    assert!(sol.diagnostics.unwrap().converged);
  }

  #[test]
  fn max_sharpe_improves_on_equal_weight() {
    let problem = three_asset_problem();
    let sol = optimize_max_sharpe(&problem, &Cancellation::new()).unwrap();
    let ew = optimize_equal_weight(&problem.mu, &problem.cov, None);
    assert!(problem.performance(&sol.weights).2 >= problem.performance(&ew).2 - 1e-12);
  }

  #[test]
  fn max_sharpe_respects_bounds() {
    let mut problem = three_asset_problem();
    problem.bounds = Bounds {
      lower: vec![0.0, 0.2, 0.0],
      upper: vec![0.4, 1.0, 1.0],
    };
    let sol = optimize_max_sharpe(&problem, &Cancellation::new()).unwrap();
    assert!(problem.bounds.contains(&sol.weights, 1e-9), "{:?}", sol.weights);
  }

  #[test]
  fn risk_parity_equalizes_contributions() {
    let problem = three_asset_problem();
    let sol = optimize_risk_parity(&problem, &Cancellation::new()).unwrap();
    let w = &sol.weights;
    let sigma_w = mat_vec_mul(&problem.cov, w);
    let var = dot(w, &sigma_w);
    for i in 0..3 {
      assert_abs_diff_eq!(w[i] * sigma_w[i] / var, 1.0 / 3.0, epsilon = 5e-3);
    }
  }

  #[test]
  fn scenarios_are_seed_reproducible() {
    let problem = three_asset_problem();
    let cancel = Cancellation::new();
    let a = simulate_scenarios(&problem.mu, &problem.cov, 100, 7, &cancel).unwrap();
    let b = simulate_scenarios(&problem.mu, &problem.cov, 100, 7, &cancel).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn cvar_is_mean_of_worst_tail() {
    let mut r = vec![0.05, -0.10, 0.02, -0.04, 0.01, 0.03, -0.02, 0.0, 0.04, 0.06];
    assert_abs_diff_eq!(empirical_cvar(&mut r, 0.2), 0.07, epsilon = 1e-12);
  }

  #[test]
  fn cancelled_solver_aborts() {
    let problem = three_asset_problem();
    let cancel = Cancellation::new();
    cancel.cancel();
    assert!(matches!(
      optimize_max_sharpe(&problem, &cancel),
      Err(PortfolioError::Cancelled)
    ));
  }

  #[test]
  fn cancellation_inside_the_solver_is_reported_not_raised() {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    let objective = move |w: &[f64]| {
      trigger.cancel();
      w.iter().map(|x| x * x).sum::<f64>()
    };

    let result = solve_projected(
      Strategy::RiskParity,
      objective,
      &Bounds::unbounded(3),
      500,
      1e-10,
      &cancel,
    );
    assert!(matches!(result, Err(PortfolioError::Cancelled)));
  }

  #[test]
  fn cancelled_cost_stays_finite() {
    let cancel = Cancellation::new();
    cancel.cancel();
    let cost = ProjectedCost {
      objective: |_: &[f64]| 1.0,
      bounds: Bounds::unbounded(2),
      cancel,
    };
    assert_eq!(cost.cost(&vec![0.5, 0.5]).unwrap(), INFEASIBLE_COST);
  }
}

