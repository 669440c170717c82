//! The `TallyLedger` and `GradeSink` traits and supporting query types.
//!
//! The traits are implemented by storage backends (e.g.
//! `tally-store-sqlite`). The engine itself never performs I/O: it computes
//! admissions, scores and transfer plans, and hands them to these seams.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
  aggregate::TransferPlan,
  counter::{CounterDefinition, CounterRuntimeState, ResolvedTally, TallyRetraction},
  cooldown::TallyReceipt,
  window::DailyActivity,
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// A tally attempt by a caller. `at` is the caller's clock reading; the
/// ledger evaluates the cooldown against its persisted state at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TallyRequest {
  pub subject_id: Uuid,
  pub counter_id: Uuid,
  pub at:         DateTime<Utc>,
}

/// Parameters for [`TallyLedger::list_runtime_states`].
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
  pub subject_id:    Option<Uuid>,
  pub counter_id:    Option<Uuid>,
  /// Restrict to counters owned by this collection.
  pub collection_id: Option<Uuid>,
  /// Restrict to counters with this `counter_type`.
  pub counter_type:  Option<String>,
}

/// Parameters for [`TallyLedger::list_events`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
  pub subject_id:        Option<Uuid>,
  pub counter_id:        Option<Uuid>,
  pub collection_id:     Option<Uuid>,
  pub since:             Option<DateTime<Utc>>,
  pub include_retracted: bool,
  pub limit:             Option<usize>,
}

/// Which tallies feed a daily-activity series.
#[derive(Debug, Clone, Default)]
pub struct ActivityScope {
  pub collection_id: Option<Uuid>,
  pub subject_id:    Option<Uuid>,
  pub counter_id:    Option<Uuid>,
}

/// Inclusive calendar-day bounds (UTC). `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
  pub from: Option<NaiveDate>,
  pub to:   Option<NaiveDate>,
}

impl DateRange {
  pub fn until(to: NaiveDate) -> Self { Self { from: None, to: Some(to) } }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Abstraction over a durable tally ledger.
///
/// Tally events are append-only. Corrections are expressed as retractions,
/// which are themselves append-only.
///
/// Implementations must make [`TallyLedger::attempt_tally`] atomic per
/// (subject, counter) pair: the cooldown check, the event append and the
/// runtime-state update happen in one unit, so that at most one attempt is
/// accepted per cooldown window even under concurrent callers.
pub trait TallyLedger: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Counter definitions ───────────────────────────────────────────────

  /// Insert or replace a counter definition supplied by configuration.
  fn put_counter(
    &self,
    definition: CounterDefinition,
  ) -> impl Future<Output = Result<CounterDefinition, Self::Error>> + Send + '_;

  fn get_counter(
    &self,
    counter_id: Uuid,
  ) -> impl Future<Output = Result<Option<CounterDefinition>, Self::Error>> + Send + '_;

  /// List the counters of a collection, optionally restricted to one type.
  fn list_counters(
    &self,
    collection_id: Uuid,
    counter_type: Option<String>,
  ) -> impl Future<Output = Result<Vec<CounterDefinition>, Self::Error>> + Send + '_;

  // ── Runtime state ─────────────────────────────────────────────────────

  /// The pair's runtime state, or `None` if it has never been tallied.
  fn get_runtime_state(
    &self,
    subject_id: Uuid,
    counter_id: Uuid,
  ) -> impl Future<Output = Result<Option<CounterRuntimeState>, Self::Error>> + Send + '_;

  fn list_runtime_states<'a>(
    &'a self,
    query: &'a StateQuery,
  ) -> impl Future<Output = Result<Vec<CounterRuntimeState>, Self::Error>> + Send + 'a;

  // ── Writes ────────────────────────────────────────────────────────────

  /// Admit and record a tally; see the trait docs for atomicity.
  ///
  /// Rejections (`NotAllowed`, `CounterInactive`, `CapReached`) leave the
  /// ledger untouched.
  fn attempt_tally(
    &self,
    request: TallyRequest,
  ) -> impl Future<Output = Result<TallyReceipt, Self::Error>> + Send + '_;

  /// Withdraw an event and subtract its increment from the pair's count.
  ///
  /// Returns an error if the event does not exist or is already retracted.
  fn retract_tally(
    &self,
    event_id: Uuid,
    reason: Option<String>,
  ) -> impl Future<Output = Result<TallyRetraction, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  fn list_events<'a>(
    &'a self,
    query: &'a EventQuery,
  ) -> impl Future<Output = Result<Vec<ResolvedTally>, Self::Error>> + Send + 'a;

  /// Per-day activity for the window aggregator, ascending by date, one
  /// entry per day with at least one active tally in scope.
  fn list_active_days<'a>(
    &'a self,
    scope: &'a ActivityScope,
    range: DateRange,
  ) -> impl Future<Output = Result<Vec<DailyActivity>, Self::Error>> + Send + 'a;
}

/// The external grading instrument that receives converted scores.
pub trait GradeSink: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Persist every entry of `plan` or none of them.
  fn commit<'a>(
    &'a self,
    plan: &'a TransferPlan,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
