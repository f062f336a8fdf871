//! Cooperative cancellation for long-running requests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::error::PortfolioError;
use crate::error::Result;

/// Shared cancel flag with an optional deadline. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
  flag: Arc<AtomicBool>,
  deadline: Option<Instant>,
}

impl Cancellation {
  /// A token that only trips on [`Cancellation::cancel`].
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_timeout(timeout: Duration) -> Self {
    Self::with_deadline(Instant::now() + timeout)
  }

  pub fn with_deadline(deadline: Instant) -> Self {
    Self {
      flag: Arc::new(AtomicBool::new(false)),
      deadline: Some(deadline),
    }
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Relaxed);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
  }

  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(PortfolioError::Cancelled)
    } else {
      Ok(())
    }
  }
}
