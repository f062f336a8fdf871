//! # portfolio-rs
//!
//! $$
//! \mathbf{w}^\* = \arg\max_{\mathbf{w}\in\Delta} \frac{\mathbf{w}^\top\mu - r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! $$
//!
//! Portfolio construction from historical prices: return statistics, a family of
//! weight optimizers, integer share allocation under a hard budget and a report with
//! frontier samples and per-asset analytics.
//!
//! The engine performs no I/O. Callers hand it price snapshots (or an already aligned
//! [`portfolio::ReturnsTable`]) and an [`portfolio::OptimizationConfig`], and receive an
//! [`portfolio::OptimizationReport`].

pub mod error;
pub mod portfolio;

pub use error::PortfolioError;
pub use error::Result;
