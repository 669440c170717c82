//! Forgetting: time decay of a tap's contribution to the effective count.
//!
//! Decay is a reporting concern only. It never changes `raw_count` and plays
//! no part in admission control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result, counter::TallyEvent};

/// The named decay family applied to each accepted tap.
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
pub enum ForgettingModel {
  #[default]
  None,
  HalfLife,
  Sigmoidal,
}

impl ForgettingModel {
  pub fn parse_lossy(name: &str) -> Self {
    name.trim().parse().unwrap_or_else(|_| {
      tracing::warn!(model = name, "unknown forgetting model, using none");
      Self::None
    })
  }
}

impl From<String> for ForgettingModel {
  fn from(name: String) -> Self { Self::parse_lossy(&name) }
}

impl From<ForgettingModel> for String {
  fn from(model: ForgettingModel) -> Self { model.to_string() }
}

#[derive(Deserialize)]
struct HalfLifeParams {
  half_life_seconds: f64,
}

#[derive(Deserialize)]
struct SigmoidalParams {
  #[serde(rename = "L", alias = "l")]
  l:  f64,
  k:  f64,
  x0: f64,
}

/// The forgetting block of a counter definition, exactly as configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForgettingSpec {
  #[serde(default)]
  pub model:  ForgettingModel,
  #[serde(default)]
  pub params: serde_json::Value,
}

/// A parsed decay curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Forgetting {
  Retain,
  HalfLife { half_life_seconds: f64 },
  /// `L / (1 + e^(k * (t - x0)))`. Starts near `L` and falls past `x0`.
  Sigmoidal { l: f64, k: f64, x0: f64 },
}

impl Forgetting {
  pub fn try_from_spec(spec: &ForgettingSpec) -> Result<Self> {
    let malformed = |reason: String| Error::MalformedForgettingParams {
      model: spec.model.to_string(),
      reason,
    };

    match spec.model {
      ForgettingModel::None => Ok(Self::Retain),
      ForgettingModel::HalfLife => {
        let HalfLifeParams { half_life_seconds } =
          serde_json::from_value(spec.params.clone()).map_err(|e| malformed(e.to_string()))?;
        if !(half_life_seconds > 0.0) {
          return Err(malformed(format!(
            "half_life_seconds must be positive, got {half_life_seconds}"
          )));
        }
        Ok(Self::HalfLife { half_life_seconds })
      }
      ForgettingModel::Sigmoidal => {
        let SigmoidalParams { l, k, x0 } =
          serde_json::from_value(spec.params.clone()).map_err(|e| malformed(e.to_string()))?;
        Ok(Self::Sigmoidal { l, k, x0 })
      }
    }
  }

  pub fn from_spec(spec: &ForgettingSpec) -> Self {
    Self::try_from_spec(spec).unwrap_or_else(|error| {
      tracing::warn!(%error, "falling back to no forgetting");
      Self::Retain
    })
  }

  /// How much of `value` survives after `elapsed_seconds`.
  pub fn retained(&self, value: f64, elapsed_seconds: f64) -> f64 {
    let elapsed = elapsed_seconds.max(0.0);
    match *self {
      Self::Retain => value,
      Self::HalfLife { half_life_seconds } => {
        value * 0.5_f64.powf(elapsed / half_life_seconds)
      }
      Self::Sigmoidal { l, k, x0 } => value * l / (1.0 + (k * (elapsed - x0)).exp()),
    }
  }
}

/// Sum the decayed contributions of `events` as seen at `now`.
pub fn effective_count<'a>(
  spec: &ForgettingSpec,
  events: impl IntoIterator<Item = &'a TallyEvent>,
  now: DateTime<Utc>,
) -> f64 {
  let forgetting = Forgetting::from_spec(spec);
  events
    .into_iter()
    .map(|event| {
      let elapsed = (now - event.recorded_at).num_milliseconds() as f64 / 1000.0;
      forgetting.retained(event.applied_increment, elapsed)
    })
    .sum()
}
