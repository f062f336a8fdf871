use std::hint::black_box;
use std::time::Instant;

use portfolio_rs::portfolio::Cancellation;
use portfolio_rs::portfolio::OptimizationConfig;
use portfolio_rs::portfolio::PortfolioEngine;
use portfolio_rs::portfolio::ReturnsTable;
use portfolio_rs::portfolio::StrategySelection;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;

fn median_ms(samples: &mut [f64]) -> f64 {
  samples.sort_by(f64::total_cmp);
  samples[samples.len() / 2]
}

fn synthetic_table(n_assets: usize, n_periods: usize, seed: u64) -> ReturnsTable {
  let mut rng = StdRng::seed_from_u64(seed);
  let market: Vec<f64> = (0..n_periods).map(|_| rng.gen_range(-0.04..0.05)).collect();
  let tickers = (0..n_assets).map(|i| format!("A{i:03}")).collect();
  let returns = (0..n_assets)
    .map(|_| {
      let beta = rng.gen_range(0.5..1.5);
      market
        .iter()
        .map(|m| beta * m + rng.gen_range(-0.03..0.03))
        .collect()
    })
    .collect();
  let prices = (0..n_assets).map(|_| rng.gen_range(5.0..400.0)).collect();
  ReturnsTable::from_columns(tickers, returns, prices).expect("synthetic table")
}

fn bench_pool(
  pool: &ThreadPool,
  engine: &PortfolioEngine,
  table: &ReturnsTable,
  warmup: usize,
  runs: usize,
) -> f64 {
  let run = || {
    pool.install(|| {
      let report = engine
        .run_optimization(table.tickers(), table, &Cancellation::new())
        .expect("optimization");
      black_box(report);
    });
  };

  for _ in 0..warmup {
    run();
  }

  let mut times_ms = Vec::with_capacity(runs);
  for _ in 0..runs {
    let t0 = Instant::now();
    run();
    times_ms.push(t0.elapsed().as_secs_f64() * 1_000.0);
  }
  median_ms(&mut times_ms)
}

fn run_case(n_assets: usize, n_periods: usize, single: &ThreadPool, multi: &ThreadPool) {
  let table = synthetic_table(n_assets, n_periods, 7);
  let mut config = OptimizationConfig::new(100_000.0);
  config.strategies = StrategySelection::All;
  let engine = PortfolioEngine::new(config);

  let warmup = 1;
  let runs = 5;
  let t1 = bench_pool(single, &engine, &table, warmup, runs);
  let tn = bench_pool(multi, &engine, &table, warmup, runs);
  let speedup = t1 / tn;
  println!(
    "assets={n_assets:<4} periods={n_periods:<5} | 1T={t1:>9.2} ms | MT={tn:>9.2} ms | speedup={speedup:>5.2}x"
  );
}

fn main() {
  let threads = std::thread::available_parallelism()
    .map(|v| v.get())
    .unwrap_or(1);
  let mt_threads = threads.max(2);
  let single = ThreadPoolBuilder::new()
    .num_threads(1)
    .build()
    .expect("failed to build single-thread pool");
  let multi = ThreadPoolBuilder::new()
    .num_threads(mt_threads)
    .build()
    .expect("failed to build multi-thread pool");

  println!("All-strategy optimization benchmark");
  println!("Using MT threads: {mt_threads}");
  println!();

  run_case(5, 60, &single, &multi);
  run_case(12, 120, &single, &multi);
  run_case(25, 250, &single, &multi);
}
