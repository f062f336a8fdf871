//! # Errors
//!
//! Request-level failures of the portfolio engine. Degenerate covariance and solver
//! non-convergence are recoverable and never surface here.

use std::fmt;

use thiserror::Error;

use crate::portfolio::types::Strategy;
use crate::portfolio::types::StrategyFailure;

pub type Result<T> = std::result::Result<T, PortfolioError>;

/// Feasibility rule checked before any optimizer runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintRule {
  /// Every limit must satisfy `0 <= min <= max <= 1`.
  MalformedBounds,
  /// Per-asset minimums must sum to at most one.
  MinimumsExceedOne,
  /// Per-asset maximums must sum to at least one.
  MaximumsBelowOne,
  /// A maximum active-asset count must be at least two.
  MaxAssetsTooSmall,
}

impl fmt::Display for ConstraintRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConstraintRule::MalformedBounds => write!(f, "malformed allocation bounds"),
      ConstraintRule::MinimumsExceedOne => write!(f, "sum of minimum weights exceeds 1"),
      ConstraintRule::MaximumsBelowOne => write!(f, "sum of maximum weights is below 1"),
      ConstraintRule::MaxAssetsTooSmall => write!(f, "max_assets must be at least 2"),
    }
  }
}

#[derive(Debug, Error)]
pub enum PortfolioError {
  #[error("insufficient data: {reason} (usable: {usable:?}, unusable: {unusable:?})")]
  InsufficientData {
    usable: Vec<String>,
    unusable: Vec<String>,
    reason: String,
  },

  #[error("infeasible constraints ({rule}): {detail}")]
  InfeasibleConstraint { rule: ConstraintRule, detail: String },

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("strategy {strategy} failed: {reason}")]
  StrategyFailed { strategy: Strategy, reason: String },

  #[error("no strategy produced a portfolio ({} failures)", .0.len())]
  NoStrategySucceeded(Vec<StrategyFailure>),

  #[error("optimization cancelled")]
  Cancelled,
}

impl PortfolioError {
  pub(crate) fn infeasible(rule: ConstraintRule, detail: impl Into<String>) -> Self {
    Self::InfeasibleConstraint {
      rule,
      detail: detail.into(),
    }
  }

  pub(crate) fn insufficient(
    usable: Vec<String>,
    unusable: Vec<String>,
    reason: impl Into<String>,
  ) -> Self {
    Self::InsufficientData {
      usable,
      unusable,
      reason: reason.into(),
    }
  }
}
