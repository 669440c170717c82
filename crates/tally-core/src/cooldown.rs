//! Cooldown state machine and admission control for tally attempts.
//!
//! ```text
//! Ready ──(accepted tally)──> Locked ──(cooldown elapsed)──> Ready
//! ```
//!
//! The phase is never stored: it is derived from `last_accepted_at`, the
//! counter's cooldown and the caller-supplied `now`. [`admit`] is the pure
//! decision; ledgers call it inside their write transaction so the decision
//! is made against the persisted state rather than a client's view of it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  counter::{CapPolicy, CounterDefinition, CounterRuntimeState, TallyEvent},
};

/// The derived cooldown phase of a (subject, counter) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CooldownPhase {
  Ready,
  Locked { remaining_seconds: u64 },
}

impl CooldownPhase {
  pub fn is_ready(&self) -> bool { matches!(self, Self::Ready) }
}

/// Time left before the pair accepts another tally, clamped to
/// `[0, cooldown]`. A `now` earlier than `last_accepted_at` counts as a full
/// cooldown.
pub fn cooldown_remaining(
  definition: &CounterDefinition,
  state: &CounterRuntimeState,
  now: DateTime<Utc>,
) -> Duration {
  let cooldown = definition.cooldown();
  let Some(last) = state.last_accepted_at else {
    return Duration::zero();
  };
  let remaining = cooldown - (now - last);
  remaining.clamp(Duration::zero(), cooldown)
}

/// [`cooldown_remaining`] in whole seconds, rounded up.
pub fn cooldown_remaining_seconds(
  definition: &CounterDefinition,
  state: &CounterRuntimeState,
  now: DateTime<Utc>,
) -> u64 {
  ceil_seconds(cooldown_remaining(definition, state, now))
}

pub fn phase(
  definition: &CounterDefinition,
  state: &CounterRuntimeState,
  now: DateTime<Utc>,
) -> CooldownPhase {
  let remaining = cooldown_remaining(definition, state, now);
  if remaining > Duration::zero() {
    CooldownPhase::Locked { remaining_seconds: ceil_seconds(remaining) }
  } else {
    CooldownPhase::Ready
  }
}

/// Any positive fraction of a second counts as a whole one, so a locked pair
/// never reports zero seconds left.
fn ceil_seconds(duration: Duration) -> u64 {
  if duration <= Duration::zero() {
    return 0;
  }
  let whole = duration.num_seconds() as u64;
  if duration.subsec_nanos() > 0 { whole + 1 } else { whole }
}

// ─── Admission ───────────────────────────────────────────────────────────────

/// The outcome of an accepted attempt: the event to append and the state to
/// persist alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
  pub event: TallyEvent,
  pub state: CounterRuntimeState,
}

impl Admission {
  pub fn receipt(&self, definition: &CounterDefinition) -> TallyReceipt {
    TallyReceipt {
      event:                      self.event.clone(),
      raw_count:                  self.state.raw_count,
      calibrated_score:           definition.calibrate(self.state.raw_count),
      cooldown_remaining_seconds: cooldown_remaining_seconds(
        definition,
        &self.state,
        self.event.recorded_at,
      ),
      capped:                     definition.is_capped(self.state.raw_count),
    }
  }
}

/// What a caller gets back from an accepted tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyReceipt {
  pub event:                      TallyEvent,
  pub raw_count:                  f64,
  pub calibrated_score:           f64,
  pub cooldown_remaining_seconds: u64,
  /// `raw_count` has reached `max_count`; purely informational for soft caps.
  pub capped:                     bool,
}

/// Decide whether `subject_id` may tally `definition` at `now`.
///
/// `state` is the pair's current runtime state, or `None` if the pair has
/// never been tallied. Rejections leave everything untouched; the caller
/// must not write anything on `Err`.
pub fn admit(
  definition: &CounterDefinition,
  state: Option<&CounterRuntimeState>,
  subject_id: Uuid,
  event_id: Uuid,
  now: DateTime<Utc>,
) -> Result<Admission> {
  if !definition.active {
    return Err(Error::CounterInactive(definition.counter_id));
  }

  let current = state
    .cloned()
    .unwrap_or_else(|| CounterRuntimeState::new(subject_id, definition.counter_id));

  if let CooldownPhase::Locked { remaining_seconds } = phase(definition, &current, now) {
    tracing::debug!(
      %subject_id,
      counter_id = %definition.counter_id,
      remaining_seconds,
      "tally rejected: cooldown active"
    );
    return Err(Error::NotAllowed { remaining_seconds });
  }

  if definition.cap_policy == CapPolicy::Hard
    && definition.increment > 0.0
    && let Some(max_count) = definition.max_count
    && current.raw_count >= max_count
  {
    return Err(Error::CapReached { counter_id: definition.counter_id, max_count });
  }

  let event = TallyEvent {
    event_id,
    subject_id,
    counter_id: definition.counter_id,
    recorded_at: now,
    applied_increment: definition.increment,
  };
  let state = CounterRuntimeState {
    raw_count: current.raw_count + definition.increment,
    last_accepted_at: Some(now),
    ..current
  };

  Ok(Admission { event, state })
}
