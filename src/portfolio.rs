//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Portfolio construction: statistics, optimizers, share allocation and reporting.

pub mod allocation;
pub mod cancel;
pub mod constraints;
pub mod data;
pub mod engine;
pub mod monte_carlo;
pub mod optimizers;
pub mod report;
pub mod types;

pub use allocation::allocate_shares;
pub use allocation::portfolio_metrics;
pub use cancel::Cancellation;
pub use constraints::apply_max_assets;
pub use constraints::validate_constraints;
pub use constraints::Bounds;
pub use data::build_returns_and_prices;
pub use data::Granularity;
pub use data::InMemoryPriceSource;
pub use data::MarketDataSource;
pub use data::PriceSeries;
pub use data::ReturnsTable;
pub use engine::PortfolioEngine;
pub use monte_carlo::sample_frontier;
pub use monte_carlo::FrontierPoint;
pub use optimizers::optimize_with_strategy;
pub use optimizers::OptimizationProblem;
pub use optimizers::WeightSolution;
pub use report::analyze_holdings;
pub use report::asset_details;
pub use report::AssetDetails;
pub use report::AssetStatistics;
pub use report::HoldingsAnalysis;
pub use report::OptimizationReport;
pub use types::AllocationLimit;
pub use types::ExperienceLevel;
pub use types::OptimizationConfig;
pub use types::PortfolioMetrics;
pub use types::PortfolioResult;
pub use types::SamplingConfig;
pub use types::SolverDiagnostics;
pub use types::Strategy;
pub use types::StrategyFailure;
pub use types::StrategySelection;
