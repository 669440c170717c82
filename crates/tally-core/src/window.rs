//! Periodic window aggregator. Buckets per-day activity into fixed-size
//! windows of *active* days and reports window-over-window evolution.
//!
//! The window size is a parameter. Two presets are in use: a 15-day window
//! for current-vs-previous trend comparison ([`WindowAggregator::compare`])
//! and 10-day chunks for longer-horizon balance analysis
//! ([`WindowAggregator::chunk`]).
//!
//! Every window is identified by a [`WindowKey`] derived from its first and
//! last active day. Completed windows can be served from a [`WindowCache`];
//! the most recent window is still growing and is always recomputed.

use std::{collections::HashMap, fmt};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{Error, Result};

/// Active days per window for trend comparison.
pub const TREND_WINDOW_DAYS: usize = 15;

/// Active days per chunk for balance analysis.
pub const BALANCE_CHUNK_DAYS: usize = 10;

// ─── Input ───────────────────────────────────────────────────────────────────

/// Aggregate activity of one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyActivity {
  pub date:         NaiveDate,
  pub positive_sum: f64,
  /// Magnitude of the day's negative increments (non-negative).
  pub negative_sum: f64,
}

impl DailyActivity {
  pub fn new(date: NaiveDate, positive_sum: f64, negative_sum: f64) -> Self {
    Self { date, positive_sum, negative_sum }
  }
}

// ─── Window identity ─────────────────────────────────────────────────────────

/// Stable identity of a window: its first and last active day.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WindowKey {
  pub start: NaiveDate,
  pub end:   NaiveDate,
}

impl fmt::Display for WindowKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}_{}", self.start.format("%Y%m%d"), self.end.format("%Y%m%d"))
  }
}

// ─── Metrics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
  pub active_day_count:      usize,
  pub positive_sum:          f64,
  pub negative_sum:          f64,
  pub net_balance:           f64,
  /// `net_balance / active_day_count`; `None` for an empty window.
  pub average_daily_balance: Option<f64>,
  /// `positive / (positive + negative)`; `None` when both are zero.
  pub positivity_rate:       Option<f64>,
}

impl WindowMetrics {
  pub fn from_days(days: &[DailyActivity]) -> Self {
    let positive_sum: f64 = days.iter().map(|d| d.positive_sum).sum();
    let negative_sum: f64 = days.iter().map(|d| d.negative_sum).sum();
    let net_balance = positive_sum - negative_sum;
    let active_day_count = days.len();
    let volume = positive_sum + negative_sum;

    Self {
      active_day_count,
      positive_sum,
      negative_sum,
      net_balance,
      average_daily_balance: (active_day_count > 0).then(|| net_balance / active_day_count as f64),
      positivity_rate: (volume != 0.0).then(|| positive_sum / volume),
    }
  }
}

// ─── Evolution ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Trend {
  Increase,
  Decrease,
  Same,
  /// Nothing meaningful to compare against.
  Initial,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricEvolution {
  pub value: Option<f64>,
  pub trend: Trend,
}

impl MetricEvolution {
  /// Compare a metric with its value in the previous window. A missing or
  /// zero previous value yields [`Trend::Initial`].
  pub fn between(current: Option<f64>, previous: Option<f64>) -> Self {
    let trend = match (current, previous) {
      (Some(current), Some(previous)) if previous != 0.0 => {
        if current > previous {
          Trend::Increase
        } else if current < previous {
          Trend::Decrease
        } else {
          Trend::Same
        }
      }
      _ => Trend::Initial,
    };
    Self { value: current, trend }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evolution {
  pub active_day_count:      MetricEvolution,
  pub positive_sum:          MetricEvolution,
  pub negative_sum:          MetricEvolution,
  pub net_balance:           MetricEvolution,
  pub average_daily_balance: MetricEvolution,
  pub positivity_rate:       MetricEvolution,
}

impl Evolution {
  pub fn between(current: &WindowMetrics, previous: Option<&WindowMetrics>) -> Self {
    let metric = |get: fn(&WindowMetrics) -> Option<f64>| {
      MetricEvolution::between(get(current), previous.and_then(get))
    };
    Self {
      active_day_count:      metric(|m| Some(m.active_day_count as f64)),
      positive_sum:          metric(|m| Some(m.positive_sum)),
      negative_sum:          metric(|m| Some(m.negative_sum)),
      net_balance:           metric(|m| Some(m.net_balance)),
      average_daily_balance: metric(|m| m.average_daily_balance),
      positivity_rate:       metric(|m| m.positivity_rate),
    }
  }

  pub fn trends(&self) -> [Trend; 6] {
    [
      self.active_day_count.trend,
      self.positive_sum.trend,
      self.negative_sum.trend,
      self.net_balance.trend,
      self.average_daily_balance.trend,
      self.positivity_rate.trend,
    ]
  }
}

// ─── Windows ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodWindow {
  pub key:          WindowKey,
  /// 1-based position among the windows of one report, oldest first.
  pub window_index: usize,
  pub start_date:   NaiveDate,
  pub end_date:     NaiveDate,
  pub metrics:      WindowMetrics,
  pub evolution:    Evolution,
}

impl PeriodWindow {
  /// Headline trend: the evolution of the net balance.
  pub fn trend(&self) -> Trend { self.evolution.net_balance.trend }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowComparison {
  pub current:  PeriodWindow,
  /// Present only with at least two full windows of active days.
  pub previous: Option<PeriodWindow>,
}

/// Result of [`WindowAggregator::compare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowReport {
  /// No active days at all. Not the same as a window whose metrics are
  /// zero.
  NoActivity,
  Compared(WindowComparison),
}

impl WindowReport {
  pub fn is_no_activity(&self) -> bool { matches!(self, Self::NoActivity) }

  pub fn comparison(&self) -> Result<&WindowComparison> {
    match self {
      Self::NoActivity => Err(Error::NoActivity),
      Self::Compared(comparison) => Ok(comparison),
    }
  }
}

/// Result of [`WindowAggregator::chunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkReport {
  NoActivity,
  Chunked { windows: Vec<PeriodWindow> },
}

impl ChunkReport {
  pub fn windows(&self) -> Result<&[PeriodWindow]> {
    match self {
      Self::NoActivity => Err(Error::NoActivity),
      Self::Chunked { windows } => Ok(windows),
    }
  }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Computed metrics keyed by window identity.
///
/// Only completed windows are stored. The most recent window is recomputed
/// on every call since its last day may still gain tallies. Entries are never invalidated implicitly: a caller that back-fills
/// activity into a past window must [`invalidate`](WindowCache::invalidate)
/// it.
#[derive(Debug, Clone, Default)]
pub struct WindowCache {
  entries: HashMap<WindowKey, WindowMetrics>,
}

impl WindowCache {
  pub fn get(&self, key: &WindowKey) -> Option<&WindowMetrics> { self.entries.get(key) }

  pub fn insert(&mut self, key: WindowKey, metrics: WindowMetrics) {
    self.entries.insert(key, metrics);
  }

  pub fn invalidate(&mut self, key: &WindowKey) -> Option<WindowMetrics> {
    self.entries.remove(key)
  }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  fn completed(&mut self, key: WindowKey, days: &[DailyActivity]) -> WindowMetrics {
    *self.entries.entry(key).or_insert_with(|| {
      tracing::debug!(%key, "computing window metrics");
      WindowMetrics::from_days(days)
    })
  }

}

// ─── Aggregator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAggregator {
  window_size: usize,
}

impl WindowAggregator {
  /// A zero size is treated as one.
  pub fn new(window_size: usize) -> Self { Self { window_size: window_size.max(1) } }

  pub fn trend() -> Self { Self::new(TREND_WINDOW_DAYS) }

  pub fn balance() -> Self { Self::new(BALANCE_CHUNK_DAYS) }

  pub fn window_size(&self) -> usize { self.window_size }

  /// Compare the most recent window with the one before it.
  pub fn compare(&self, days: &[DailyActivity], today: NaiveDate) -> WindowReport {
    self.compare_cached(days, today, &mut WindowCache::default())
  }

  /// [`compare`](Self::compare), serving the previous window from `cache`.
  /// The current window is never cached.
  pub fn compare_cached(
    &self,
    days: &[DailyActivity],
    today: NaiveDate,
    cache: &mut WindowCache,
  ) -> WindowReport {
    let days = normalize(days, today);
    let size = self.window_size;
    let count = days.len();
    if count == 0 {
      return WindowReport::NoActivity;
    }

    let current_days = &days[count.saturating_sub(size)..];
    let current_metrics = WindowMetrics::from_days(current_days);

    let previous = (count >= 2 * size).then(|| {
      let previous_days = &days[count - 2 * size..count - size];
      let metrics = cache.completed(key_of(previous_days), previous_days);
      build_window(previous_days, 1, metrics, None)
    });

    let current = build_window(
      current_days,
      if previous.is_some() { 2 } else { 1 },
      current_metrics,
      previous.as_ref().map(|p| &p.metrics),
    );

    WindowReport::Compared(WindowComparison { current, previous })
  }

  /// Split the whole history into consecutive windows, oldest first, each
  /// compared with the window before it. The last window may be partial.
  pub fn chunk(&self, days: &[DailyActivity], today: NaiveDate) -> ChunkReport {
    self.chunk_cached(days, today, &mut WindowCache::default())
  }

  pub fn chunk_cached(
    &self,
    days: &[DailyActivity],
    today: NaiveDate,
    cache: &mut WindowCache,
  ) -> ChunkReport {
    let days = normalize(days, today);
    if days.is_empty() {
      return ChunkReport::NoActivity;
    }

    let chunk_count = days.len().div_ceil(self.window_size);
    let mut windows: Vec<PeriodWindow> = Vec::with_capacity(chunk_count);
    for (i, chunk) in days.chunks(self.window_size).enumerate() {
      let metrics = if i + 1 < chunk_count {
        cache.completed(key_of(chunk), chunk)
      } else {
        WindowMetrics::from_days(chunk)
      };
      let previous = windows.last().map(|w| &w.metrics);
      let window = build_window(chunk, i + 1, metrics, previous);
      windows.push(window);
    }

    ChunkReport::Chunked { windows }
  }
}

/// Keep days up to `today`, sorted, one entry per date.
fn normalize(days: &[DailyActivity], today: NaiveDate) -> Vec<DailyActivity> {
  let mut sorted: Vec<DailyActivity> = days.iter().copied().filter(|d| d.date <= today).collect();
  sorted.sort_by_key(|d| d.date);

  let mut merged: Vec<DailyActivity> = Vec::with_capacity(sorted.len());
  for day in sorted {
    match merged.last_mut() {
      Some(last) if last.date == day.date => {
        last.positive_sum += day.positive_sum;
        last.negative_sum += day.negative_sum;
      }
      _ => merged.push(day),
    }
  }
  merged
}

/// `days` must be non-empty.
fn key_of(days: &[DailyActivity]) -> WindowKey {
  let start = days.first().map(|d| d.date).unwrap_or_default();
  let end = days.last().map(|d| d.date).unwrap_or(start);
  WindowKey { start, end }
}

fn build_window(
  days: &[DailyActivity],
  window_index: usize,
  metrics: WindowMetrics,
  previous: Option<&WindowMetrics>,
) -> PeriodWindow {
  let key = key_of(days);
  PeriodWindow {
    key,
    window_index,
    start_date: key.start,
    end_date: key.end,
    metrics,
    evolution: Evolution::between(&metrics, previous),
  }
}
