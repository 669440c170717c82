//! Encoding and decoding helpers between engine types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 UTC strings with a fixed microsecond width, so
//! lexical order matches chronological order and the first ten characters
//! are the UTC calendar day. Counter definitions are stored as JSON.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use tally_core::{
  counter::{CounterDefinition, CounterRuntimeState, ResolvedTally, TallyEvent, TallyStatus},
  window::DailyActivity,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_date(date: NaiveDate) -> String { date.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Counter definitions ─────────────────────────────────────────────────────

pub fn encode_definition(definition: &CounterDefinition) -> Result<String> {
  Ok(serde_json::to_string(definition)?)
}

pub fn decode_definition(s: &str) -> Result<CounterDefinition> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read from a `runtime_states` row.
pub struct RawRuntimeState {
  pub subject_id:       String,
  pub counter_id:       String,
  pub raw_count:        f64,
  pub last_accepted_at: Option<String>,
}

impl RawRuntimeState {
  pub const COLUMNS: &'static str = "rs.subject_id, rs.counter_id, rs.raw_count, rs.last_accepted_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_id:       row.get(0)?,
      counter_id:       row.get(1)?,
      raw_count:        row.get(2)?,
      last_accepted_at: row.get(3)?,
    })
  }

  pub fn into_state(self) -> Result<CounterRuntimeState> {
    Ok(CounterRuntimeState {
      subject_id:       decode_uuid(&self.subject_id)?,
      counter_id:       decode_uuid(&self.counter_id)?,
      raw_count:        self.raw_count,
      last_accepted_at: self.last_accepted_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

/// Raw values read from a `tally_events` row joined with its retraction.
pub struct RawResolvedTally {
  pub event_id:          String,
  pub subject_id:        String,
  pub counter_id:        String,
  pub recorded_at:       String,
  pub applied_increment: f64,
  // tally_retractions join
  pub retraction_reason: Option<String>,
  pub retracted_at:      Option<String>,
}

impl RawResolvedTally {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:          row.get(0)?,
      subject_id:        row.get(1)?,
      counter_id:        row.get(2)?,
      recorded_at:       row.get(3)?,
      applied_increment: row.get(4)?,
      retraction_reason: row.get(5)?,
      retracted_at:      row.get(6)?,
    })
  }

  pub fn into_resolved(self) -> Result<ResolvedTally> {
    let event = TallyEvent {
      event_id:          decode_uuid(&self.event_id)?,
      subject_id:        decode_uuid(&self.subject_id)?,
      counter_id:        decode_uuid(&self.counter_id)?,
      recorded_at:       decode_dt(&self.recorded_at)?,
      applied_increment: self.applied_increment,
    };

    let status = match self.retracted_at {
      Some(at) => TallyStatus::Retracted { reason: self.retraction_reason, at: decode_dt(&at)? },
      None => TallyStatus::Active,
    };

    Ok(ResolvedTally { event, status })
  }
}

/// One grouped row of the daily-activity query.
pub struct RawDailyActivity {
  pub day:          String,
  pub positive_sum: f64,
  pub negative_sum: f64,
}

impl RawDailyActivity {
  pub fn into_activity(self) -> Result<DailyActivity> {
    Ok(DailyActivity::new(decode_date(&self.day)?, self.positive_sum, self.negative_sum))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_lexically_and_start_with_the_day() {
    let whole = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
    let later = whole + chrono::Duration::milliseconds(1);

    let (a, b) = (encode_dt(whole), encode_dt(later));
    assert_eq!(a.len(), b.len());
    assert!(a < b);
    assert_eq!(&a[..10], "2024-03-09");
    assert_eq!(decode_dt(&b).unwrap(), later);
  }
}
