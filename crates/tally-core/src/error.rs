//! Error types for `tally-core`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// The counter is still cooling down for this subject.
  #[error("tally not allowed: cooldown active for another {remaining_seconds}s")]
  NotAllowed { remaining_seconds: u64 },

  #[error("counter {0} is inactive")]
  CounterInactive(Uuid),

  #[error("counter not found: {0}")]
  CounterNotFound(Uuid),

  /// A hard-capped counter has already reached its `max_count`.
  #[error("counter {counter_id} reached its cap of {max_count}")]
  CapReached { counter_id: Uuid, max_count: f64 },

  #[error("invalid scale: {0}")]
  InvalidScale(f64),

  /// Only ever surfaced by the `try_*` parsers; scoring falls back to the
  /// identity transform instead.
  #[error("malformed calibration params for model {model:?}: {reason}")]
  MalformedCalibrationParams { model: String, reason: String },

  #[error("malformed forgetting params for model {model:?}: {reason}")]
  MalformedForgettingParams { model: String, reason: String },

  #[error("no activity recorded")]
  NoActivity,

  #[error("instrument record {0:?} appears more than once in the transfer")]
  DuplicateInstrumentRecord(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
