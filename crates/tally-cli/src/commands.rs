//! Subcommand handlers. Each returns a serialisable report; `main` prints it
//! as JSON on stdout.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tally_core::{
  Error as CoreError,
  aggregate::{
    self, CollectionStatistics, CounterUsage, TransferEntry, TransferPlan, TypeTotals,
  },
  calibration,
  cooldown::{self, CooldownPhase, TallyReceipt},
  counter::{CounterDefinition, DefinitionWarning, ResolvedTally, TallyRetraction},
  forgetting,
  ledger::{ActivityScope, DateRange, EventQuery, GradeSink, StateQuery, TallyLedger, TallyRequest},
  window::{ChunkReport, WindowAggregator, WindowReport},
};
use tally_store_sqlite::{Error as StoreError, SqliteStore};
use uuid::Uuid;

// ─── sync ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SyncedCounter {
  pub counter_id:   Uuid,
  pub counter_type: String,
  pub label:        String,
  pub warnings:     Vec<DefinitionWarning>,
}

/// Register every configured counter, reporting definition warnings.
pub async fn sync(
  store: &SqliteStore,
  counters: &[CounterDefinition],
) -> anyhow::Result<Vec<SyncedCounter>> {
  let mut synced = Vec::with_capacity(counters.len());
  for definition in counters {
    let warnings = definition.validate();
    for warning in &warnings {
      tracing::warn!(counter_id = %definition.counter_id, ?warning, "counter definition warning");
    }
    store
      .put_counter(definition.clone())
      .await
      .with_context(|| format!("failed to store counter {}", definition.counter_id))?;
    synced.push(SyncedCounter {
      counter_id: definition.counter_id,
      counter_type: definition.counter_type.clone(),
      label: definition.label.clone(),
      warnings,
    });
  }
  tracing::info!(count = synced.len(), "counters synced");
  Ok(synced)
}

/// Store a copy of `counter_id` under a new id and label. Its history stays
/// with the original.
pub async fn duplicate(
  store: &SqliteStore,
  counter_id: Uuid,
  label: String,
) -> anyhow::Result<CounterDefinition> {
  let original = store
    .get_counter(counter_id)
    .await?
    .ok_or(CoreError::CounterNotFound(counter_id))?;
  let copy = store
    .put_counter(original.duplicate(label))
    .await
    .context("failed to store duplicated counter")?;
  tracing::info!(%counter_id, duplicate_id = %copy.counter_id, "counter duplicated");
  Ok(copy)
}

// ─── tap ─────────────────────────────────────────────────────────────────────

/// Outcome of `tally tap`. Refusals are ordinary outcomes, not failures.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TapOutcome {
  Accepted(TallyReceipt),
  NotAllowed { remaining_seconds: u64 },
  CapReached { max_count: f64 },
  Inactive,
}

pub async fn tap(store: &SqliteStore, request: TallyRequest) -> anyhow::Result<TapOutcome> {
  match store.attempt_tally(request).await {
    Ok(receipt) => Ok(TapOutcome::Accepted(receipt)),
    Err(StoreError::Core(CoreError::NotAllowed { remaining_seconds })) => {
      Ok(TapOutcome::NotAllowed { remaining_seconds })
    }
    Err(StoreError::Core(CoreError::CapReached { max_count, .. })) => {
      Ok(TapOutcome::CapReached { max_count })
    }
    Err(StoreError::Core(CoreError::CounterInactive(_))) => Ok(TapOutcome::Inactive),
    Err(e) => Err(e).context("tally attempt failed"),
  }
}

// ─── status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CounterStatus {
  pub counter_id:       Uuid,
  pub counter_type:     String,
  pub label:            String,
  pub raw_count:        f64,
  pub calibrated_score: f64,
  /// Sum of active tallies after the counter's forgetting curve.
  pub effective_count:  f64,
  pub cooldown:         CooldownPhase,
  pub capped:           bool,
}

pub async fn status(
  store: &SqliteStore,
  subject_id: Uuid,
  counter_id: Option<Uuid>,
  now: DateTime<Utc>,
) -> anyhow::Result<Vec<CounterStatus>> {
  let states = store
    .list_runtime_states(&StateQuery {
      subject_id: Some(subject_id),
      counter_id,
      ..Default::default()
    })
    .await?;

  let mut report = Vec::with_capacity(states.len());
  for state in states {
    let definition = store
      .get_counter(state.counter_id)
      .await?
      .with_context(|| format!("counter {} has state but no definition", state.counter_id))?;

    let events = store
      .list_events(&EventQuery {
        subject_id: Some(subject_id),
        counter_id: Some(state.counter_id),
        ..Default::default()
      })
      .await?;
    let effective_count =
      forgetting::effective_count(&definition.forgetting, events.iter().map(|r| &r.event), now);

    report.push(CounterStatus {
      counter_id: definition.counter_id,
      counter_type: definition.counter_type.clone(),
      label: definition.label.clone(),
      raw_count: state.raw_count,
      calibrated_score: definition.calibrate(state.raw_count),
      effective_count,
      cooldown: cooldown::phase(&definition, &state, now),
      capped: definition.is_capped(state.raw_count),
    });
  }
  Ok(report)
}

// ─── history / retract ───────────────────────────────────────────────────────

pub async fn history(store: &SqliteStore, query: &EventQuery) -> anyhow::Result<Vec<ResolvedTally>> {
  Ok(store.list_events(query).await?)
}

pub async fn retract(
  store: &SqliteStore,
  event_id: Uuid,
  reason: Option<String>,
) -> anyhow::Result<TallyRetraction> {
  store
    .retract_tally(event_id, reason)
    .await
    .with_context(|| format!("failed to retract {event_id}"))
}

// ─── summary / stats ─────────────────────────────────────────────────────────

/// Per-type totals of one subject within a collection.
pub async fn summary(
  store: &SqliteStore,
  collection_id: Uuid,
  subject_id: Uuid,
  counter_type: Option<String>,
) -> anyhow::Result<Vec<TypeTotals>> {
  let definitions = store.list_counters(collection_id, counter_type.clone()).await?;
  let states = store
    .list_runtime_states(&StateQuery {
      subject_id: Some(subject_id),
      collection_id: Some(collection_id),
      counter_type,
      ..Default::default()
    })
    .await?;

  let snapshots = aggregate::snapshots(&definitions, &states, subject_id);
  let types: BTreeSet<&str> = definitions.iter().map(|d| d.counter_type.as_str()).collect();
  Ok(types.into_iter().map(|t| aggregate::aggregate_by_type(&snapshots, t)).collect())
}

/// Total calibrated score per subject over the collection's counters.
async fn subject_scores(
  store: &SqliteStore,
  collection_id: Uuid,
  counter_type: Option<String>,
) -> anyhow::Result<(Vec<CounterDefinition>, BTreeMap<Uuid, f64>)> {
  let definitions = store.list_counters(collection_id, counter_type.clone()).await?;
  let states = store
    .list_runtime_states(&StateQuery {
      collection_id: Some(collection_id),
      counter_type,
      ..Default::default()
    })
    .await?;

  let by_id: HashMap<Uuid, &CounterDefinition> =
    definitions.iter().map(|d| (d.counter_id, d)).collect();
  let mut scores: BTreeMap<Uuid, f64> = BTreeMap::new();
  for state in &states {
    if let Some(definition) = by_id.get(&state.counter_id) {
      *scores.entry(state.subject_id).or_default() += definition.calibrate(state.raw_count);
    }
  }
  Ok((definitions, scores))
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
  pub subjects: usize,
  pub scores:   CollectionStatistics,
  pub usage:    CounterUsage,
}

pub async fn stats(
  store: &SqliteStore,
  collection_id: Uuid,
  counter_type: Option<String>,
  top_n: usize,
) -> anyhow::Result<StatsReport> {
  let (definitions, scores) = subject_scores(store, collection_id, counter_type).await?;
  let values: Vec<f64> = scores.values().copied().collect();

  let counter_ids: BTreeSet<Uuid> = definitions.iter().map(|d| d.counter_id).collect();
  let events = store
    .list_events(&EventQuery { collection_id: Some(collection_id), ..Default::default() })
    .await?;
  let usage = aggregate::usage_statistics(
    events
      .iter()
      .map(|r| &r.event)
      .filter(|e| counter_ids.contains(&e.counter_id)),
    top_n,
  );

  Ok(StatsReport {
    subjects: scores.len(),
    scores: aggregate::collection_statistics(&values),
    usage,
  })
}

// ─── trend / balance ─────────────────────────────────────────────────────────

pub async fn trend(
  store: &SqliteStore,
  scope: &ActivityScope,
  today: NaiveDate,
  window_size: usize,
) -> anyhow::Result<WindowReport> {
  let days = store.list_active_days(scope, DateRange::until(today)).await?;
  Ok(WindowAggregator::new(window_size).compare(&days, today))
}

pub async fn balance(
  store: &SqliteStore,
  scope: &ActivityScope,
  today: NaiveDate,
  window_size: usize,
) -> anyhow::Result<ChunkReport> {
  let days = store.list_active_days(scope, DateRange::until(today)).await?;
  Ok(WindowAggregator::new(window_size).chunk(&days, today))
}

// ─── transfer ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TransferReport {
  pub committed: bool,
  pub plan:      TransferPlan,
  /// Mapped subjects with no tallies in scope; transferred as zero.
  pub untallied: Vec<Uuid>,
}

pub struct TransferArgs {
  pub collection_id:  Uuid,
  pub counter_type:   Option<String>,
  /// (subject, instrument record id)
  pub records:        Vec<(Uuid, String)>,
  pub counter_scale:  Option<f64>,
  pub instrument_max: f64,
  pub confirm:        bool,
}

/// The scale shared by `definitions`, or `None` when there are none.
fn declared_scale(definitions: &[CounterDefinition]) -> anyhow::Result<Option<f64>> {
  let mut scales = definitions.iter().map(|d| (d.counter_id, d.effective_scale()));
  let Some((_, scale)) = scales.next() else {
    return Ok(None);
  };
  if let Some((counter_id, other)) = scales.find(|(_, s)| *s != scale) {
    anyhow::bail!(
      "counters in scope declare different scales ({scale} and {other} on {counter_id}); \
       narrow with --type or pass --counter-scale"
    );
  }
  Ok(Some(scale))
}

/// Build a transfer plan; commit it to the grade sink only with `confirm`.
///
/// Without an explicit `counter_scale` the counters' own scale is used.
pub async fn transfer(store: &SqliteStore, args: TransferArgs) -> anyhow::Result<TransferReport> {
  let (definitions, scores) = subject_scores(store, args.collection_id, args.counter_type).await?;
  let counter_scale = match args.counter_scale {
    Some(scale) => Some(scale),
    None => declared_scale(&definitions)?,
  };

  let mut untallied = Vec::new();
  let entries: Vec<TransferEntry> = args
    .records
    .into_iter()
    .map(|(subject_id, instrument_record_id)| {
      let calibrated_score = scores.get(&subject_id).copied().unwrap_or_else(|| {
        untallied.push(subject_id);
        0.0
      });
      TransferEntry { instrument_record_id, subject_id, calibrated_score }
    })
    .collect();

  let plan = aggregate::plan_transfer(entries, counter_scale, args.instrument_max)
    .context("invalid transfer")?;

  if args.confirm {
    store.commit(&plan).await.context("failed to commit transfer")?;
  } else {
    tracing::info!(entries = plan.entries.len(), "dry run; pass --confirm to write");
  }

  Ok(TransferReport { committed: args.confirm, plan, untallied })
}

// ─── calibrate ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CalibrationReport {
  pub model:      String,
  pub raw:        f64,
  pub calibrated: f64,
}

pub fn calibrate(model: &str, params: &serde_json::Value, raw: f64) -> CalibrationReport {
  CalibrationReport {
    model: model.to_owned(),
    raw,
    calibrated: calibration::calibrate(model, params, raw),
  }
}
