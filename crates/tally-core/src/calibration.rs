//! Calibration: mapping a raw tally count onto a normalised score.
//!
//! A counter declares a [`CalibrationModel`] and a free-form JSON parameter
//! object. Parameters are parsed into a typed [`Calibration`] before use.
//! Malformed parameters never block scoring: they degrade to the identity
//! transform with a warning.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result};

// ─── Model ───────────────────────────────────────────────────────────────────

/// The named function family a counter uses to calibrate its raw count.
///
/// Unknown names deserialise to [`CalibrationModel::None`].
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
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(from = "String", into = "String")]
pub enum CalibrationModel {
  #[default]
  #[strum(to_string = "none", serialize = "nenhum")]
  None,
  #[strum(to_string = "linear")]
  Linear,
  #[strum(to_string = "exponential", serialize = "exponencial")]
  Exponential,
  #[strum(to_string = "logistic", serialize = "logistico", serialize = "logístico")]
  Logistic,
}

impl CalibrationModel {
  /// Parse a model name, treating anything unrecognised as `None`.
  pub fn parse_lossy(name: &str) -> Self {
    name.trim().parse().unwrap_or_else(|_| {
      tracing::warn!(model = name, "unknown calibration model, using none");
      Self::None
    })
  }
}

impl From<String> for CalibrationModel {
  fn from(name: String) -> Self { Self::parse_lossy(&name) }
}

impl From<CalibrationModel> for String {
  fn from(model: CalibrationModel) -> Self { model.to_string() }
}

// ─── Parameter shapes ────────────────────────────────────────────────────────

/// One `{raw, calibrated}` anchor of a piecewise-linear calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
  pub raw:        f64,
  pub calibrated: f64,
}

#[derive(Deserialize)]
struct LinearParams {
  points: Vec<Breakpoint>,
}

#[derive(Deserialize)]
struct ExponentialParams {
  a: f64,
  b: f64,
}

#[derive(Deserialize)]
struct LogisticParams {
  #[serde(rename = "L", alias = "l")]
  l:  f64,
  k:  f64,
  x0: f64,
}

// ─── Spec (as configured) ────────────────────────────────────────────────────

/// The calibration block of a counter definition, exactly as configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpec {
  #[serde(default)]
  pub model:  CalibrationModel,
  #[serde(default)]
  pub params: serde_json::Value,
}

impl CalibrationSpec {
  pub fn new(model: CalibrationModel, params: serde_json::Value) -> Self {
    Self { model, params }
  }

  /// Calibrate `raw` under this spec, falling back to identity on bad params.
  pub fn score(&self, raw: f64) -> f64 { Calibration::from_spec(self).apply(raw) }
}

// ─── Parsed transform ────────────────────────────────────────────────────────

/// A validated calibration transform, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
  Identity,
  /// Breakpoints sorted ascending by `raw`; always at least two.
  Linear(Vec<Breakpoint>),
  Exponential { a: f64, b: f64 },
  Logistic { l: f64, k: f64, x0: f64 },
}

impl Calibration {
  /// Parse `params` for `model`, reporting malformed input.
  pub fn try_new(model: CalibrationModel, params: &serde_json::Value) -> Result<Self> {
    let malformed = |reason: String| Error::MalformedCalibrationParams {
      model: model.to_string(),
      reason,
    };

    match model {
      CalibrationModel::None => Ok(Self::Identity),
      CalibrationModel::Linear => {
        let parsed: LinearParams = serde_json::from_value(params.clone())
          .map_err(|e| malformed(e.to_string()))?;
        if parsed.points.len() < 2 {
          return Err(malformed(format!(
            "need at least two breakpoints, got {}",
            parsed.points.len()
          )));
        }
        // Sorting happens on the owned copy; the caller's params are untouched.
        let mut points = parsed.points;
        points.sort_by(|p1, p2| p1.raw.total_cmp(&p2.raw));
        Ok(Self::Linear(points))
      }
      CalibrationModel::Exponential => {
        let ExponentialParams { a, b } = serde_json::from_value(params.clone())
          .map_err(|e| malformed(e.to_string()))?;
        Ok(Self::Exponential { a, b })
      }
      CalibrationModel::Logistic => {
        let LogisticParams { l, k, x0 } = serde_json::from_value(params.clone())
          .map_err(|e| malformed(e.to_string()))?;
        Ok(Self::Logistic { l, k, x0 })
      }
    }
  }

  /// Like [`Calibration::try_new`], but degrades to [`Calibration::Identity`].
  pub fn new(model: CalibrationModel, params: &serde_json::Value) -> Self {
    Self::try_new(model, params).unwrap_or_else(|error| {
      tracing::warn!(%error, "falling back to identity calibration");
      Self::Identity
    })
  }

  pub fn from_spec(spec: &CalibrationSpec) -> Self { Self::new(spec.model, &spec.params) }

  pub fn try_from_spec(spec: &CalibrationSpec) -> Result<Self> {
    Self::try_new(spec.model, &spec.params)
  }

  /// Apply the transform. Total: never panics, never fails.
  pub fn apply(&self, raw: f64) -> f64 {
    match self {
      Self::Identity => raw,
      Self::Linear(points) => interpolate(points, raw),
      Self::Exponential { a, b } => a * (b * raw).exp(),
      Self::Logistic { l, k, x0 } => l / (1.0 + (-k * (raw - x0)).exp()),
    }
  }
}

fn interpolate(points: &[Breakpoint], raw: f64) -> f64 {
  for pair in points.windows(2) {
    let (p1, p2) = (pair[0], pair[1]);
    if raw >= p1.raw && raw <= p2.raw {
      if p2.raw == p1.raw {
        return p1.calibrated;
      }
      return p1.calibrated
        + (raw - p1.raw) * (p2.calibrated - p1.calibrated) / (p2.raw - p1.raw);
    }
  }

  match (points.first(), points.last()) {
    (Some(first), _) if raw < first.raw => first.calibrated,
    (_, Some(last)) if raw > last.raw => last.calibrated,
    _ => raw,
  }
}

/// Calibrate `raw` under a model given by name.
///
/// Unknown model names and malformed params both yield `raw` unchanged.
pub fn calibrate(model: &str, params: &serde_json::Value, raw: f64) -> f64 {
  Calibration::new(CalibrationModel::parse_lossy(model), params).apply(raw)
}
