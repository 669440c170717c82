//! Aggregation and transfer: combining calibrated scores across counters and
//! subjects, and rescaling them into an external grading instrument.
//!
//! Everything here is a pure computation. Writing converted scores is a
//! separate step: callers review a [`TransferPlan`] and hand it to a
//! [`GradeSink`](crate::ledger::GradeSink) explicitly.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  counter::{CounterDefinition, CounterRuntimeState, DEFAULT_COUNTER_SCALE, TallyEvent},
  round2,
};

// ─── Per-type totals ─────────────────────────────────────────────────────────

/// One counter of one subject, as seen by the aggregations.
#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot<'a> {
  pub definition: &'a CounterDefinition,
  pub raw_count:  f64,
}

impl CounterSnapshot<'_> {
  pub fn calibrated(&self) -> f64 { self.definition.calibrate(self.raw_count) }
}

/// Pair each definition with the subject's runtime state. Counters the
/// subject has never been tallied on contribute a raw count of zero.
pub fn snapshots<'a>(
  definitions: &'a [CounterDefinition],
  states: &[CounterRuntimeState],
  subject_id: Uuid,
) -> Vec<CounterSnapshot<'a>> {
  definitions
    .iter()
    .map(|definition| {
      let raw_count = states
        .iter()
        .find(|s| s.subject_id == subject_id && s.counter_id == definition.counter_id)
        .map_or(0.0, |s| s.raw_count);
      CounterSnapshot { definition, raw_count }
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeTotals {
  pub counter_type:     String,
  pub counter_count:    usize,
  pub total_raw:        f64,
  pub total_calibrated: f64,
}

/// Sum raw and calibrated values over the snapshots whose type matches.
/// An empty match is `{0, 0}`, not an error.
pub fn aggregate_by_type(snapshots: &[CounterSnapshot<'_>], counter_type: &str) -> TypeTotals {
  let matching = snapshots
    .iter()
    .filter(|s| s.definition.counter_type == counter_type);

  let mut totals = TypeTotals {
    counter_type:     counter_type.to_owned(),
    counter_count:    0,
    total_raw:        0.0,
    total_calibrated: 0.0,
  };
  for snapshot in matching {
    totals.counter_count += 1;
    totals.total_raw += snapshot.raw_count;
    totals.total_calibrated += snapshot.calibrated();
  }
  totals
}

// ─── Collection statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatistics {
  /// Mean, rounded to two decimals.
  pub avg: f64,
  pub max: f64,
  pub min: f64,
}

/// Average, max and min of the calibrated scores of a collection's subjects.
pub fn collection_statistics(scores: &[f64]) -> CollectionStatistics {
  if scores.is_empty() {
    return CollectionStatistics { avg: 0.0, max: 0.0, min: 0.0 };
  }
  let sum: f64 = scores.iter().sum();
  CollectionStatistics {
    avg: round2(sum / scores.len() as f64),
    max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    min: scores.iter().copied().fold(f64::INFINITY, f64::min),
  }
}

// ─── Transfer ────────────────────────────────────────────────────────────────

/// Rescale a calibrated score into an instrument's scale:
/// `(score / counter_scale) * instrument_max`.
///
/// `counter_scale` defaults to [`DEFAULT_COUNTER_SCALE`]. A non-positive or
/// non-finite counter scale, or a negative instrument maximum, is rejected
/// with [`Error::InvalidScale`] instead of yielding `NaN` or infinity.
pub fn transfer_to_instrument(
  calibrated_score: f64,
  counter_scale: Option<f64>,
  instrument_max: f64,
) -> Result<f64> {
  let counter_scale = checked_scales(counter_scale, instrument_max)?;
  Ok((calibrated_score / counter_scale) * instrument_max)
}

fn checked_scales(counter_scale: Option<f64>, instrument_max: f64) -> Result<f64> {
  let counter_scale = counter_scale.unwrap_or(DEFAULT_COUNTER_SCALE);
  if !counter_scale.is_finite() || counter_scale <= 0.0 {
    return Err(Error::InvalidScale(counter_scale));
  }
  if !instrument_max.is_finite() || instrument_max < 0.0 {
    return Err(Error::InvalidScale(instrument_max));
  }
  Ok(counter_scale)
}

/// One subject's score bound for an instrument record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEntry {
  pub instrument_record_id: String,
  pub subject_id:           Uuid,
  pub calibrated_score:     f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedScore {
  pub instrument_record_id: String,
  pub subject_id:           Uuid,
  pub calibrated_score:     f64,
  pub converted_score:      f64,
}

/// A reviewable, deterministic batch of converted scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPlan {
  pub counter_scale:  f64,
  pub instrument_max: f64,
  /// Sorted by `instrument_record_id`.
  pub entries:        Vec<ConvertedScore>,
}

/// Convert a batch of scores. Any invalid input fails the whole plan.
pub fn plan_transfer(
  entries: impl IntoIterator<Item = TransferEntry>,
  counter_scale: Option<f64>,
  instrument_max: f64,
) -> Result<TransferPlan> {
  let counter_scale = checked_scales(counter_scale, instrument_max)?;

  let mut by_record = BTreeMap::new();
  for entry in entries {
    let converted = ConvertedScore {
      converted_score:      (entry.calibrated_score / counter_scale) * instrument_max,
      instrument_record_id: entry.instrument_record_id.clone(),
      subject_id:           entry.subject_id,
      calibrated_score:     entry.calibrated_score,
    };
    if by_record.insert(entry.instrument_record_id.clone(), converted).is_some() {
      return Err(Error::DuplicateInstrumentRecord(entry.instrument_record_id));
    }
  }

  Ok(TransferPlan {
    counter_scale,
    instrument_max,
    entries: by_record.into_values().collect(),
  })
}

// ─── Usage statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectUsage {
  pub subject_id: Uuid,
  pub events:     usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
  pub date:   NaiveDate,
  pub events: usize,
}

/// How often a counter is used, across subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterUsage {
  pub total_events:            usize,
  pub unique_subjects:         usize,
  /// Rounded to two decimals; zero when there are no events.
  pub mean_events_per_subject: f64,
  /// Most active subjects first; ties broken by subject id.
  pub top_subjects:            Vec<SubjectUsage>,
  /// One entry per UTC day with at least one event, ascending.
  pub daily:                   Vec<DailyCount>,
}

pub fn usage_statistics<'a>(
  events: impl IntoIterator<Item = &'a TallyEvent>,
  top_n: usize,
) -> CounterUsage {
  let mut per_subject: BTreeMap<Uuid, usize> = BTreeMap::new();
  let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
  let mut total_events = 0;

  for event in events {
    total_events += 1;
    *per_subject.entry(event.subject_id).or_default() += 1;
    *per_day.entry(event.recorded_at.date_naive()).or_default() += 1;
  }

  let unique_subjects = per_subject.len();
  let mean_events_per_subject = if unique_subjects == 0 {
    0.0
  } else {
    round2(total_events as f64 / unique_subjects as f64)
  };

  let mut top_subjects: Vec<SubjectUsage> = per_subject
    .into_iter()
    .map(|(subject_id, events)| SubjectUsage { subject_id, events })
    .collect();
  // Stable sort keeps the BTreeMap's id order among equal counts.
  top_subjects.sort_by(|a, b| b.events.cmp(&a.events));
  top_subjects.truncate(top_n);

  CounterUsage {
    total_events,
    unique_subjects,
    mean_events_per_subject,
    top_subjects,
    daily: per_day
      .into_iter()
      .map(|(date, events)| DailyCount { date, events })
      .collect(),
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone, Utc};
  use serde_json::json;

  use super::*;
  use crate::calibration::{CalibrationModel, CalibrationSpec};

  fn linear_counter(counter_type: &str) -> CounterDefinition {
    let mut def = CounterDefinition::new(Uuid::nil(), counter_type, 1.0, 0);
    def.calibration = CalibrationSpec::new(
      CalibrationModel::Linear,
      json!({ "points": [{ "raw": 0, "calibrated": 0 }, { "raw": 10, "calibrated": 100 }] }),
    );
    def
  }

  #[test]
  fn empty_aggregation_is_zero() {
    let totals = aggregate_by_type(&[], "participation");
    assert_eq!(totals.total_raw, 0.0);
    assert_eq!(totals.total_calibrated, 0.0);
    assert_eq!(totals.counter_count, 0);
  }

  #[test]
  fn single_counter_aggregation_equals_its_own_values() {
    let def = linear_counter("participation");
    let snapshot = CounterSnapshot { definition: &def, raw_count: 4.0 };

    let totals = aggregate_by_type(&[snapshot], "participation");
    assert_eq!(totals.total_raw, 4.0);
    assert_eq!(totals.total_calibrated, 40.0);
  }

  #[test]
  fn aggregation_filters_by_type() {
    let participation = linear_counter("participation");
    let attitude = linear_counter("attitude");
    let uncalibrated = CounterDefinition::new(Uuid::nil(), "participation", 1.0, 0);

    let snaps = [
      CounterSnapshot { definition: &participation, raw_count: 2.0 },
      CounterSnapshot { definition: &attitude, raw_count: 7.0 },
      CounterSnapshot { definition: &uncalibrated, raw_count: 3.0 },
    ];
    let totals = aggregate_by_type(&snaps, "participation");
    assert_eq!(totals.counter_count, 2);
    assert_eq!(totals.total_raw, 5.0);
    assert_eq!(totals.total_calibrated, 23.0);
  }

  #[test]
  fn snapshots_default_missing_state_to_zero() {
    let subject = Uuid::new_v4();
    let defs = [linear_counter("participation"), linear_counter("participation")];
    let mut state = CounterRuntimeState::new(subject, defs[0].counter_id);
    state.raw_count = 6.0;
    let other = CounterRuntimeState {
      subject_id: Uuid::new_v4(),
      ..CounterRuntimeState::new(subject, defs[1].counter_id)
    };

    let snaps = snapshots(&defs, &[state, other], subject);
    assert_eq!(snaps[0].raw_count, 6.0);
    assert_eq!(snaps[1].raw_count, 0.0);
  }

  #[test]
  fn statistics_round_average_to_two_decimals() {
    let stats = collection_statistics(&[10.0, 20.0, 20.0]);
    assert_eq!(stats.avg, 16.67);
    assert_eq!(stats.max, 20.0);
    assert_eq!(stats.min, 10.0);
  }

  #[test]
  fn statistics_of_nothing_are_zero() {
    assert_eq!(collection_statistics(&[]), CollectionStatistics {
      avg: 0.0,
      max: 0.0,
      min: 0.0,
    });
  }

  #[test]
  fn transfer_rescales() {
    assert_eq!(transfer_to_instrument(80.0, Some(100.0), 20.0).unwrap(), 16.0);
    assert_eq!(transfer_to_instrument(80.0, None, 20.0).unwrap(), 16.0);
  }

  #[test]
  fn transfer_onto_same_scale_is_identity() {
    for (score, scale) in [(13.5, 20.0), (0.0, 5.0), (99.0, 100.0)] {
      assert_eq!(transfer_to_instrument(score, Some(scale), scale).unwrap(), score);
    }
  }

  #[test]
  fn zero_or_negative_scale_is_rejected() {
    assert!(matches!(
      transfer_to_instrument(50.0, Some(0.0), 20.0),
      Err(Error::InvalidScale(s)) if s == 0.0
    ));
    assert!(matches!(
      transfer_to_instrument(50.0, Some(-10.0), 20.0),
      Err(Error::InvalidScale(_))
    ));
    assert!(matches!(
      transfer_to_instrument(50.0, Some(10.0), -1.0),
      Err(Error::InvalidScale(_))
    ));
  }

  #[test]
  fn plan_is_sorted_and_all_or_nothing() {
    let entry = |record: &str, score: f64| TransferEntry {
      instrument_record_id: record.to_owned(),
      subject_id:           Uuid::new_v4(),
      calibrated_score:     score,
    };

    let plan = plan_transfer(
      vec![entry("quiz-2/b", 50.0), entry("quiz-2/a", 100.0)],
      Some(100.0),
      20.0,
    )
    .unwrap();
    let ids: Vec<_> = plan.entries.iter().map(|e| e.instrument_record_id.as_str()).collect();
    assert_eq!(ids, ["quiz-2/a", "quiz-2/b"]);
    assert_eq!(plan.entries[0].converted_score, 20.0);
    assert_eq!(plan.entries[1].converted_score, 10.0);

    let duplicate = plan_transfer(
      vec![entry("quiz-2/a", 50.0), entry("quiz-2/a", 60.0)],
      None,
      20.0,
    );
    assert!(matches!(duplicate, Err(Error::DuplicateInstrumentRecord(id)) if id == "quiz-2/a"));

    assert!(plan_transfer(vec![entry("quiz-2/a", 50.0)], Some(0.0), 20.0).is_err());
  }

  #[test]
  fn usage_counts_subjects_and_days() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
    let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
    let event = |subject_id, at| TallyEvent {
      event_id: Uuid::new_v4(),
      subject_id,
      counter_id: Uuid::nil(),
      recorded_at: at,
      applied_increment: 1.0,
    };
    let events = [
      event(a, t0),
      event(a, t0 + Duration::minutes(5)),
      event(b, t0 + Duration::days(1)),
    ];

    let usage = usage_statistics(&events, 5);
    assert_eq!(usage.total_events, 3);
    assert_eq!(usage.unique_subjects, 2);
    assert_eq!(usage.mean_events_per_subject, 1.5);
    assert_eq!(usage.top_subjects[0], SubjectUsage { subject_id: a, events: 2 });
    assert_eq!(usage.daily.len(), 2);
    assert_eq!(usage.daily[0].events, 2);

    let top_one = usage_statistics(&events, 1);
    assert_eq!(top_one.top_subjects.len(), 1);
  }
}
