//! Counter definitions, per-subject runtime state and ledger records.
//!
//! A [`CounterDefinition`] is owned by the collection (dossier) that created
//! it. [`CounterRuntimeState`] and [`TallyEvent`] are addressed by the pair
//! (subject, counter). Events are immutable; corrections are recorded as
//! [`TallyRetraction`]s, never as edits.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{
  calibration::{Calibration, CalibrationModel, CalibrationSpec},
  forgetting::{Forgetting, ForgettingSpec},
};

/// Counter scale assumed by transfers when a counter declares none.
pub const DEFAULT_COUNTER_SCALE: f64 = 100.0;

// ─── Definition ──────────────────────────────────────────────────────────────

/// Whether reaching `max_count` blocks further tallies.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Display,
  AsRefStr,
  EnumString,
  Serialize,
  Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CapPolicy {
  /// The cap only affects reporting; tallies keep being accepted.
  #[default]
  Soft,
  /// Positive tallies are refused once `raw_count >= max_count`.
  Hard,
}

fn default_active() -> bool { true }

/// Static configuration for one tally type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterDefinition {
  pub counter_id:       Uuid,
  pub collection_id:    Uuid,
  /// Category tag used for grouping (e.g. "participation").
  pub counter_type:     String,
  #[serde(default)]
  pub label:            String,
  /// Signed amount added to `raw_count` per accepted tap.
  pub increment:        f64,
  #[serde(default)]
  pub cooldown_seconds: u64,
  #[serde(default)]
  pub max_count:        Option<f64>,
  #[serde(default)]
  pub cap_policy:       CapPolicy,
  #[serde(default)]
  pub calibration:      CalibrationSpec,
  #[serde(default)]
  pub forgetting:       ForgettingSpec,
  /// Scale of the calibrated score; see [`DEFAULT_COUNTER_SCALE`].
  #[serde(default)]
  pub scale:            Option<f64>,
  #[serde(default = "default_active")]
  pub active:           bool,
}

impl CounterDefinition {
  /// A plain, active, uncalibrated counter.
  pub fn new(
    collection_id: Uuid,
    counter_type: impl Into<String>,
    increment: f64,
    cooldown_seconds: u64,
  ) -> Self {
    Self {
      counter_id: Uuid::new_v4(),
      collection_id,
      counter_type: counter_type.into(),
      label: String::new(),
      increment,
      cooldown_seconds,
      max_count: None,
      cap_policy: CapPolicy::default(),
      calibration: CalibrationSpec::default(),
      forgetting: ForgettingSpec::default(),
      scale: None,
      active: true,
    }
  }

  pub fn cooldown(&self) -> Duration {
    // `Duration::seconds` panics past `i64::MAX / 1000`.
    let seconds = self.cooldown_seconds.min((i64::MAX / 1000) as u64);
    Duration::seconds(seconds as i64)
  }

  /// A copy of this counter under a fresh id and a new label. Tallies and
  /// runtime state belong to the original and are not carried over.
  pub fn duplicate(&self, label: impl Into<String>) -> Self {
    Self { counter_id: Uuid::new_v4(), label: label.into(), ..self.clone() }
  }

  pub fn effective_scale(&self) -> f64 { self.scale.unwrap_or(DEFAULT_COUNTER_SCALE) }

  /// Calibrated score for `raw_count` under this counter's model.
  pub fn calibrate(&self, raw_count: f64) -> f64 { self.calibration.score(raw_count) }

  /// Whether `raw_count` has reached the (soft or hard) cap.
  pub fn is_capped(&self, raw_count: f64) -> bool {
    self.max_count.is_some_and(|max| raw_count >= max)
  }

  /// Check the definition for configuration mistakes.
  ///
  /// Warnings are advisory: none of them prevents tallying, and malformed
  /// calibration still scores through the identity transform.
  pub fn validate(&self) -> Vec<DefinitionWarning> {
    let mut warnings = Vec::new();

    if !self.increment.is_finite() {
      warnings.push(DefinitionWarning::NonFiniteIncrement);
    }
    let scale = self.effective_scale();
    if !(scale > 0.0) || !scale.is_finite() {
      warnings.push(DefinitionWarning::InvalidScale { scale });
    }

    match Calibration::try_from_spec(&self.calibration) {
      Err(e) => {
        warnings.push(DefinitionWarning::MalformedCalibration { reason: e.to_string() });
      }
      Ok(Calibration::Linear(points)) => {
        let above: Vec<f64> = points
          .iter()
          .map(|p| p.calibrated)
          .filter(|calibrated| *calibrated > scale)
          .collect();
        if !above.is_empty() {
          warnings.push(DefinitionWarning::BreakpointsAboveScale { scale, calibrated: above });
        }
      }
      Ok(Calibration::Logistic { l, .. }) if l > scale => {
        warnings.push(DefinitionWarning::LogisticCeilingAboveScale { scale, l });
      }
      Ok(calibration @ Calibration::Exponential { .. }) => {
        let at_100 = calibration.apply(100.0);
        if at_100 > scale * 1.5 {
          warnings.push(DefinitionWarning::ExponentialOutgrowsScale { scale, at_100 });
        }
      }
      Ok(_) => {}
    }

    if let Err(e) = Forgetting::try_from_spec(&self.forgetting) {
      warnings.push(DefinitionWarning::MalformedForgetting { reason: e.to_string() });
    }

    if self.calibration.model == CalibrationModel::None && !self.calibration.params.is_null() {
      let empty_object = self.calibration.params.as_object().is_some_and(|o| o.is_empty());
      if !empty_object {
        warnings.push(DefinitionWarning::UnusedCalibrationParams);
      }
    }

    warnings
  }
}

/// A non-fatal problem found by [`CounterDefinition::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum DefinitionWarning {
  NonFiniteIncrement,
  InvalidScale { scale: f64 },
  MalformedCalibration { reason: String },
  MalformedForgetting { reason: String },
  BreakpointsAboveScale { scale: f64, calibrated: Vec<f64> },
  LogisticCeilingAboveScale { scale: f64, l: f64 },
  /// `a * e^(b * 100)` exceeds one and a half times the scale.
  ExponentialOutgrowsScale { scale: f64, at_100: f64 },
  UnusedCalibrationParams,
}

// ─── Runtime state ───────────────────────────────────────────────────────────

/// Per-(subject, counter) accumulator. Created lazily on first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterRuntimeState {
  pub subject_id:       Uuid,
  pub counter_id:       Uuid,
  pub raw_count:        f64,
  pub last_accepted_at: Option<DateTime<Utc>>,
}

impl CounterRuntimeState {
  pub fn new(subject_id: Uuid, counter_id: Uuid) -> Self {
    Self { subject_id, counter_id, raw_count: 0.0, last_accepted_at: None }
  }
}

// ─── Ledger records ──────────────────────────────────────────────────────────

/// An accepted tally. Once written, no field is ever updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyEvent {
  pub event_id:          Uuid,
  pub subject_id:        Uuid,
  pub counter_id:        Uuid,
  pub recorded_at:       DateTime<Utc>,
  pub applied_increment: f64,
}

/// Records that a tally event was withdrawn by an external correction.
/// An event can be retracted at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyRetraction {
  pub retraction_id: Uuid,
  pub event_id:      Uuid,
  pub reason:        Option<String>,
  pub recorded_at:   DateTime<Utc>,
}

/// The lifecycle status of a tally event, computed at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TallyStatus {
  Active,
  Retracted {
    reason: Option<String>,
    at:     DateTime<Utc>,
  },
}

impl TallyStatus {
  pub fn is_active(&self) -> bool { matches!(self, Self::Active) }
}

/// A tally event bundled with its current lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTally {
  pub event:  TallyEvent,
  pub status: TallyStatus,
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn definition() -> CounterDefinition {
    CounterDefinition::new(Uuid::new_v4(), "participation", 1.0, 60)
  }

  #[test]
  fn duplicate_keeps_configuration_under_a_new_id() {
    let mut original = definition();
    original.label = "Participation".into();
    original.scale = Some(20.0);
    original.max_count = Some(5.0);

    let copy = original.duplicate("Participation (2nd term)");
    assert_ne!(copy.counter_id, original.counter_id);
    assert_eq!(copy.label, "Participation (2nd term)");
    assert_eq!(copy.collection_id, original.collection_id);
    assert_eq!(copy.calibration, original.calibration);
    assert_eq!(
      CounterDefinition { counter_id: original.counter_id, label: original.label.clone(), ..copy },
      original
    );
  }

  #[test]
  fn deserialises_with_defaults() {
    let value = json!({
      "counter_id": Uuid::new_v4(),
      "collection_id": Uuid::new_v4(),
      "counter_type": "attitude",
      "increment": -1
    });
    let def: CounterDefinition = serde_json::from_value(value).unwrap();

    assert!(def.active);
    assert_eq!(def.cooldown_seconds, 0);
    assert_eq!(def.cap_policy, CapPolicy::Soft);
    assert_eq!(def.calibration.model, CalibrationModel::None);
    assert_eq!(def.effective_scale(), DEFAULT_COUNTER_SCALE);
  }

  #[test]
  fn negative_cooldown_is_rejected_at_the_boundary() {
    let value = json!({
      "counter_id": Uuid::new_v4(),
      "collection_id": Uuid::new_v4(),
      "counter_type": "attitude",
      "increment": 1,
      "cooldown_seconds": -5
    });
    assert!(serde_json::from_value::<CounterDefinition>(value).is_err());
  }

  #[test]
  fn plain_definition_has_no_warnings() {
    assert!(definition().validate().is_empty());
  }

  #[test]
  fn breakpoints_above_scale_are_flagged() {
    let mut def = definition();
    def.scale = Some(20.0);
    def.calibration = CalibrationSpec::new(
      CalibrationModel::Linear,
      json!({ "points": [{ "raw": 0, "calibrated": 0 }, { "raw": 10, "calibrated": 25 }] }),
    );

    let warnings = def.validate();
    assert_eq!(warnings, vec![DefinitionWarning::BreakpointsAboveScale {
      scale:      20.0,
      calibrated: vec![25.0],
    }]);
  }

  #[test]
  fn malformed_calibration_is_a_warning_not_an_error() {
    let mut def = definition();
    def.calibration = CalibrationSpec::new(CalibrationModel::Logistic, json!({ "L": 10 }));

    assert!(matches!(
      def.validate().as_slice(),
      [DefinitionWarning::MalformedCalibration { .. }]
    ));
    assert_eq!(def.calibrate(4.0), 4.0);
  }

  #[test]
  fn fast_exponential_is_flagged() {
    let mut def = definition();
    def.scale = Some(20.0);
    def.calibration =
      CalibrationSpec::new(CalibrationModel::Exponential, json!({ "a": 1, "b": 0.1 }));

    assert!(matches!(
      def.validate().as_slice(),
      [DefinitionWarning::ExponentialOutgrowsScale { .. }]
    ));
  }

  #[test]
  fn cap_is_inclusive() {
    let mut def = definition();
    def.max_count = Some(3.0);
    assert!(!def.is_capped(2.0));
    assert!(def.is_capped(3.0));
  }
}
