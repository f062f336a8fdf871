//! # Portfolio Data Utilities
//!
//! $$
//! r_{i,t} = \frac{P_{i,t}}{P_{i,t-1}} - 1,\qquad
//! \hat\Sigma_{ij} = \frac{1}{T-1}\sum_{t=1}^{T}(r_{i,t}-\bar r_i)(r_{j,t}-\bar r_j)
//! $$
//!
//! Price series, period alignment, and the return statistics every optimizer consumes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;

use chrono::Datelike;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use tracing::debug;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;

/// Fewest aligned return observations that give a finite unbiased covariance.
pub const MIN_OBSERVATIONS: usize = 2;

const STD_FLOOR: f64 = 1e-15;

/// Resampling grid for price series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
  Daily,
  /// ISO weeks.
  Weekly,
  #[default]
  Monthly,
}

impl Granularity {
  /// Return periods per calendar year, used to scale annual rates.
  pub fn periods_per_year(&self) -> f64 {
    match self {
      Granularity::Daily => 252.0,
      Granularity::Weekly => 52.0,
      Granularity::Monthly => 12.0,
    }
  }

  /// Bucket containing `date`.
  pub fn period_of(&self, date: NaiveDate) -> Period {
    match self {
      Granularity::Daily => Period {
        granularity: *self,
        year: date.year(),
        index: date.ordinal(),
      },
      Granularity::Weekly => {
        let week = date.iso_week();
        Period {
          granularity: *self,
          year: week.year(),
          index: week.week(),
        }
      }
      Granularity::Monthly => Period {
        granularity: *self,
        year: date.year(),
        index: date.month(),
      },
    }
  }
}

/// One bucket of the resampling grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
  granularity: Granularity,
  year: i32,
  index: u32,
}

impl fmt::Display for Period {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.granularity {
      Granularity::Daily => match NaiveDate::from_yo_opt(self.year, self.index) {
        Some(date) => write!(f, "{date}"),
        None => write!(f, "{}-{:03}", self.year, self.index),
      },
      Granularity::Weekly => write!(f, "{}-W{:02}", self.year, self.index),
      Granularity::Monthly => write!(f, "{}-{:02}", self.year, self.index),
    }
  }
}

impl Serialize for Period {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

/// Dated closing prices for one asset, sorted by date. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
  ticker: String,
  observations: Vec<(NaiveDate, f64)>,
}

impl PriceSeries {
  /// Sort observations by date. Non-positive or non-finite closes are discarded.
  pub fn new(ticker: impl Into<String>, mut observations: Vec<(NaiveDate, f64)>) -> Self {
    observations.retain(|(_, close)| close.is_finite() && *close > 0.0);
    observations.sort_by_key(|(date, _)| *date);
    Self {
      ticker: ticker.into(),
      observations,
    }
  }

  pub fn ticker(&self) -> &str {
    &self.ticker
  }

  pub fn observations(&self) -> &[(NaiveDate, f64)] {
    &self.observations
  }

  pub fn is_empty(&self) -> bool {
    self.observations.is_empty()
  }

  /// Most recent close.
  pub fn latest(&self) -> Option<f64> {
    self.observations.last().map(|(_, close)| *close)
  }

  /// Last close in each period of `granularity`.
  pub fn resample(&self, granularity: Granularity) -> BTreeMap<Period, f64> {
    let mut buckets = BTreeMap::new();
    for (date, close) in &self.observations {
      buckets.insert(granularity.period_of(*date), *close);
    }
    buckets
  }
}

/// Aligned per-period returns and latest prices over an asset universe.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnsTable {
  tickers: Vec<String>,
  periods: Vec<Period>,
  /// One column per ticker.
  returns: Vec<Vec<f64>>,
  latest_prices: Vec<f64>,
  excluded: Vec<String>,
}

impl ReturnsTable {
  /// Build a table from pre-aligned return columns.
  pub fn from_columns(
    tickers: Vec<String>,
    returns: Vec<Vec<f64>>,
    latest_prices: Vec<f64>,
  ) -> Result<Self> {
    if tickers.len() != returns.len() || tickers.len() != latest_prices.len() {
      return Err(PortfolioError::InvalidConfig(format!(
        "{} tickers, {} return columns and {} prices do not line up",
        tickers.len(),
        returns.len(),
        latest_prices.len()
      )));
    }
    let n_obs = returns.first().map(Vec::len).unwrap_or(0);
    if returns.iter().any(|col| col.len() != n_obs) {
      return Err(PortfolioError::InvalidConfig(
        "return columns must have equal length".to_string(),
      ));
    }

    Ok(Self {
      tickers,
      periods: Vec::new(),
      returns,
      latest_prices,
      excluded: Vec::new(),
    })
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Period labels of each return row; empty for tables built from raw columns.
  pub fn periods(&self) -> &[Period] {
    &self.periods
  }

  pub fn returns(&self) -> &[Vec<f64>] {
    &self.returns
  }

  pub fn latest_prices(&self) -> &[f64] {
    &self.latest_prices
  }

  /// Tickers requested but left out of the table, with no usable history.
  pub fn excluded(&self) -> &[String] {
    &self.excluded
  }

  pub fn n_assets(&self) -> usize {
    self.tickers.len()
  }

  pub fn n_observations(&self) -> usize {
    self.returns.first().map(Vec::len).unwrap_or(0)
  }

  pub fn column(&self, ticker: &str) -> Option<&[f64]> {
    self
      .tickers
      .iter()
      .position(|t| t == ticker)
      .map(|i| self.returns[i].as_slice())
  }

  /// Restrict to `tickers` (in the given order). Unknown tickers and tickers without a
  /// positive finite price are returned separately instead of being dropped silently.
  pub fn select(&self, tickers: &[String]) -> (ReturnsTable, Vec<String>) {
    let mut kept = Vec::new();
    let mut returns = Vec::new();
    let mut prices = Vec::new();
    let mut missing = Vec::new();

    for ticker in tickers {
      if kept.contains(ticker) {
        continue;
      }
      match self.tickers.iter().position(|t| t == ticker) {
        Some(i) if self.latest_prices[i].is_finite() && self.latest_prices[i] > 0.0 => {
          kept.push(ticker.clone());
          returns.push(self.returns[i].clone());
          prices.push(self.latest_prices[i]);
        }
        _ => missing.push(ticker.clone()),
      }
    }

    let table = ReturnsTable {
      tickers: kept,
      periods: self.periods.clone(),
      returns,
      latest_prices: prices,
      excluded: self.excluded.clone(),
    };
    (table, missing)
  }

  /// Per-asset sample mean return.
  pub fn mean_vector(&self) -> Vec<f64> {
    self.returns.iter().map(|col| sample_mean(col)).collect()
  }

  /// Unbiased (`T - 1`) covariance of all asset pairs.
  pub fn covariance_matrix(&self) -> Vec<Vec<f64>> {
    covariance_matrix(&self.returns)
  }

  /// Pearson correlation, exactly one on the diagonal.
  pub fn correlation_matrix(&self) -> Vec<Vec<f64>> {
    corr_from_cov(&self.covariance_matrix())
  }
}

/// Resample price series onto a common grid and compute aligned period returns.
///
/// Assets with fewer than two periods are excluded and reported in
/// [`ReturnsTable::excluded`]; an empty series is an error.
pub fn build_returns_and_prices(
  series: &[PriceSeries],
  granularity: Granularity,
) -> Result<ReturnsTable> {
  let mut seen = BTreeSet::new();
  for s in series {
    if !seen.insert(s.ticker()) {
      return Err(PortfolioError::InvalidConfig(format!(
        "duplicate price series for {}",
        s.ticker()
      )));
    }
  }

  let (empty, non_empty): (Vec<&PriceSeries>, Vec<&PriceSeries>) =
    series.iter().partition(|s| s.is_empty());
  if !empty.is_empty() {
    return Err(PortfolioError::insufficient(
      non_empty.iter().map(|s| s.ticker().to_string()).collect(),
      empty.iter().map(|s| s.ticker().to_string()).collect(),
      "empty price series",
    ));
  }

  let mut usable = Vec::new();
  let mut excluded = Vec::new();
  for s in non_empty {
    let buckets = s.resample(granularity);
    if buckets.len() < 2 {
      warn!(ticker = s.ticker(), periods = buckets.len(), "excluding asset with too short a history");
      excluded.push(s.ticker().to_string());
    } else {
      usable.push((s, buckets));
    }
  }

  let usable_names = || usable.iter().map(|(s, _)| s.ticker().to_string()).collect::<Vec<_>>();
  if usable.len() < 2 {
    return Err(PortfolioError::insufficient(
      usable_names(),
      excluded,
      "at least two assets with two or more periods are required",
    ));
  }

  let mut common: BTreeSet<Period> = usable[0].1.keys().copied().collect();
  for (_, buckets) in &usable[1..] {
    common.retain(|p| buckets.contains_key(p));
  }
  let grid: Vec<Period> = common.into_iter().collect();

  if grid.len() < MIN_OBSERVATIONS + 1 {
    return Err(PortfolioError::insufficient(
      usable_names(),
      excluded,
      format!(
        "only {} overlapping periods, {} needed",
        grid.len(),
        MIN_OBSERVATIONS + 1
      ),
    ));
  }

  let mut tickers = Vec::with_capacity(usable.len());
  let mut returns = Vec::with_capacity(usable.len());
  let mut latest_prices = Vec::with_capacity(usable.len());
  for (s, buckets) in &usable {
    let closes: Vec<f64> = grid.iter().map(|p| buckets[p]).collect();
    returns.push(simple_returns_series(&closes));
    tickers.push(s.ticker().to_string());
    latest_prices.push(s.latest().unwrap_or(0.0));
  }

  debug!(
    assets = tickers.len(),
    periods = grid.len(),
    excluded = excluded.len(),
    "aligned return table"
  );

  Ok(ReturnsTable {
    tickers,
    periods: grid[1..].to_vec(),
    returns,
    latest_prices,
    excluded,
  })
}

/// Supplier of price history; the only data feed the engine consumes.
pub trait MarketDataSource {
  /// Aligned returns, latest prices and the tickers that could be used.
  fn load_returns_and_prices(
    &self,
    tickers: &[String],
    granularity: Granularity,
  ) -> Result<ReturnsTable>;
}

/// Snapshot source over already fetched price series.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPriceSource {
  series: HashMap<String, PriceSeries>,
}

impl InMemoryPriceSource {
  pub fn new(series: impl IntoIterator<Item = PriceSeries>) -> Self {
    Self {
      series: series
        .into_iter()
        .map(|s| (s.ticker().to_string(), s))
        .collect(),
    }
  }

  pub fn get(&self, ticker: &str) -> Option<&PriceSeries> {
    self.series.get(ticker)
  }
}

impl MarketDataSource for InMemoryPriceSource {
  fn load_returns_and_prices(
    &self,
    tickers: &[String],
    granularity: Granularity,
  ) -> Result<ReturnsTable> {
    let mut found = Vec::new();
    let mut unknown = Vec::new();
    for ticker in tickers {
      match self.series.get(ticker) {
        Some(s) if !found.iter().any(|f: &PriceSeries| f.ticker() == ticker) => {
          found.push(s.clone())
        }
        Some(_) => {}
        None => {
          warn!(ticker = ticker.as_str(), "no price history");
          unknown.push(ticker.clone());
        }
      }
    }

    if found.len() < 2 {
      return Err(PortfolioError::insufficient(
        found.iter().map(|s| s.ticker().to_string()).collect(),
        unknown,
        "price history available for fewer than two tickers",
      ));
    }

    let mut table = build_returns_and_prices(&found, granularity)?;
    table.excluded.extend(unknown);
    Ok(table)
  }
}

pub(crate) fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

pub(crate) fn sample_std(xs: &[f64]) -> f64 {
  if xs.len() < 2 {
    return 0.0;
  }
  let m = sample_mean(xs);
  let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
  (ss / (xs.len() - 1) as f64).sqrt()
}

/// Convert close prices to fractional period returns.
pub fn simple_returns_series(closes: &[f64]) -> Vec<f64> {
  closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

/// Unbiased covariance matrix of equal-length return columns.
pub fn covariance_matrix(columns: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = columns.len();
  let t = columns.first().map(Vec::len).unwrap_or(0);
  let mut cov = vec![vec![0.0; n]; n];
  if t < 2 {
    return cov;
  }

  let means: Vec<f64> = columns.iter().map(|c| sample_mean(c)).collect();
  for i in 0..n {
    for j in i..n {
      let mut acc = 0.0;
      for k in 0..t {
        acc += (columns[i][k] - means[i]) * (columns[j][k] - means[j]);
      }
      let c = acc / (t - 1) as f64;
      cov[i][j] = c;
      cov[j][i] = c;
    }
  }
  cov
}

/// Correlation implied by a covariance matrix.
pub fn corr_from_cov(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = cov.len();
  let sd: Vec<f64> = (0..n).map(|i| cov[i][i].max(0.0).sqrt()).collect();
  let mut corr = vec![vec![0.0; n]; n];

  for i in 0..n {
    for j in 0..n {
      let denom = sd[i] * sd[j];
      corr[i][j] = if i == j {
        1.0
      } else if denom > STD_FLOOR {
        (cov[i][j] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      };
    }
  }

  corr
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
  mat.iter().map(|row| dot(row, v)).collect()
}

/// $\mathbf{w}^\top\Sigma\mathbf{w}$, floored at zero.
pub fn portfolio_variance(w: &[f64], cov: &[Vec<f64>]) -> f64 {
  dot(w, &mat_vec_mul(cov, w)).max(0.0)
}

/// Sharpe ratio with the zero-volatility convention: a degenerate denominator yields 0.
pub fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free: f64) -> f64 {
  if volatility > STD_FLOOR && volatility.is_finite() {
    (expected_return - risk_free) / volatility
  } else {
    0.0
  }
}

/// (expected return, volatility, Sharpe) of continuous weights.
pub fn portfolio_performance(
  w: &[f64],
  mu: &[f64],
  cov: &[Vec<f64>],
  risk_free: f64,
) -> (f64, f64, f64) {
  let ret = dot(w, mu);
  let vol = portfolio_variance(w, cov).sqrt();
  (ret, vol, sharpe_ratio(ret, vol, risk_free))
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn monthly(ticker: &str, closes: &[f64]) -> PriceSeries {
    let obs = closes
      .iter()
      .enumerate()
      .map(|(i, c)| (date(2023 + (i / 12) as i32, (i % 12) as u32 + 1, 28), *c))
      .collect();
    PriceSeries::new(ticker, obs)
  }

  #[test]
  fn monthly_resampling_keeps_last_close() {
    let s = PriceSeries::new(
      "AAA",
      vec![
        (date(2024, 1, 31), 12.0),
        (date(2024, 1, 2), 10.0),
        (date(2024, 2, 15), 11.0),
        (date(2024, 2, 29), 14.0),
      ],
    );
    let buckets: Vec<f64> = s.resample(Granularity::Monthly).into_values().collect();
    assert_eq!(buckets, vec![12.0, 14.0]);
  }

  #[test]
  fn returns_are_aligned_on_common_periods() {
    let a = monthly("AAA", &[100.0, 110.0, 121.0, 133.1]);
    let b = PriceSeries::new(
      "BBB",
      vec![
        (date(2023, 1, 28), 50.0),
        (date(2023, 3, 28), 55.0),
        (date(2023, 4, 28), 44.0),
      ],
    );
    let table = build_returns_and_prices(&[a, b], Granularity::Monthly).unwrap();

    assert_eq!(table.n_observations(), 2);
    assert_abs_diff_eq!(table.returns()[0][0], 0.21, epsilon = 1e-12);
    assert_abs_diff_eq!(table.returns()[1][0], 0.1, epsilon = 1e-12);
    assert_abs_diff_eq!(table.returns()[1][1], -0.2, epsilon = 1e-12);
    assert_eq!(table.latest_prices(), &[133.1, 44.0]);
    assert_eq!(table.periods()[0].to_string(), "2023-03");
  }

  #[test]
  fn empty_series_is_insufficient_data() {
    let a = monthly("AAA", &[1.0, 2.0, 3.0]);
    let b = PriceSeries::new("BBB", vec![]);
    match build_returns_and_prices(&[a, b], Granularity::Monthly) {
      Err(PortfolioError::InsufficientData {
        usable, unusable, ..
      }) => {
        assert_eq!(usable, vec!["AAA".to_string()]);
        assert_eq!(unusable, vec!["BBB".to_string()]);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn short_history_is_excluded_and_reported() {
    let a = monthly("AAA", &[1.0, 2.0, 3.0, 4.0]);
    let b = monthly("BBB", &[5.0, 4.0, 6.0, 5.0]);
    let c = monthly("CCC", &[7.0]);
    let table = build_returns_and_prices(&[a, b, c], Granularity::Monthly).unwrap();
    assert_eq!(table.tickers(), &["AAA".to_string(), "BBB".to_string()]);
    assert_eq!(table.excluded(), &["CCC".to_string()]);
  }

  #[test]
  fn single_usable_asset_fails() {
    let a = monthly("AAA", &[1.0, 2.0, 3.0]);
    let c = monthly("CCC", &[7.0]);
    assert!(matches!(
      build_returns_and_prices(&[a, c], Granularity::Monthly),
      Err(PortfolioError::InsufficientData { .. })
    ));
  }

  #[test]
  fn covariance_is_unbiased_and_symmetric() {
    let cols = vec![vec![0.01, 0.03, -0.02, 0.02], vec![0.02, 0.01, 0.0, -0.01]];
    let cov = covariance_matrix(&cols);
    let m0 = 0.01;
    let expected_var0 = [0.0, 0.02, -0.03, 0.01]
      .iter()
      .map(|d: &f64| d * d)
      .sum::<f64>()
      / 3.0;
    assert_abs_diff_eq!(sample_mean(&cols[0]), m0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov[0][0], expected_var0, epsilon = 1e-15);
    assert_eq!(cov[0][1], cov[1][0]);
  }

  #[test]
  fn correlation_diagonal_is_exactly_one() {
    let cols = vec![
      vec![0.01, 0.03, -0.02, 0.02],
      vec![0.02, 0.01, 0.0, -0.01],
      vec![0.0, 0.0, 0.0, 0.0],
    ];
    let corr = corr_from_cov(&covariance_matrix(&cols));
    for (i, row) in corr.iter().enumerate() {
      assert_eq!(row[i], 1.0);
    }
    assert_eq!(corr[0][2], 0.0);
  }

  #[test]
  fn zero_volatility_sharpe_is_zero() {
    assert_eq!(sharpe_ratio(0.05, 0.0, 0.01), 0.0);
    assert_eq!(sharpe_ratio(0.05, f64::NAN, 0.01), 0.0);
  }

  #[test]
  fn in_memory_source_reports_unknown_tickers() {
    let source = InMemoryPriceSource::new(vec![
      monthly("AAA", &[1.0, 2.0, 3.0, 4.0]),
      monthly("BBB", &[4.0, 3.0, 5.0, 4.0]),
    ]);
    let tickers = vec!["AAA".to_string(), "BBB".to_string(), "ZZZ".to_string()];
    let table = source
      .load_returns_and_prices(&tickers, Granularity::Monthly)
      .unwrap();
    assert_eq!(table.excluded(), &["ZZZ".to_string()]);
    assert_eq!(table.n_assets(), 2);
  }
}
