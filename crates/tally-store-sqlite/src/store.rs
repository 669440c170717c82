//! [`SqliteStore`]: the SQLite implementation of [`TallyLedger`] and
//! [`GradeSink`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use tally_core::{
  aggregate::{ConvertedScore, TransferPlan},
  cooldown::{self, Admission, TallyReceipt},
  counter::{CounterDefinition, CounterRuntimeState, ResolvedTally, TallyRetraction},
  ledger::{ActivityScope, DateRange, EventQuery, GradeSink, StateQuery, TallyLedger, TallyRequest},
  window::DailyActivity,
};

use crate::{
  Error, Result,
  encode::{
    RawDailyActivity, RawResolvedTally, RawRuntimeState, decode_definition, decode_uuid,
    encode_date, encode_definition, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A tally ledger backed by a single SQLite file.
///
/// Clones share one connection thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a private in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every score committed through [`GradeSink::commit`], by record id.
  pub async fn list_instrument_scores(&self) -> Result<Vec<ConvertedScore>> {
    let raws: Vec<(String, String, f64, f64)> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT instrument_record_id, subject_id, calibrated_score, converted_score
           FROM instrument_scores
           ORDER BY instrument_record_id",
        )?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(instrument_record_id, subject_id, calibrated_score, converted_score)| {
        Ok(ConvertedScore {
          instrument_record_id,
          subject_id: decode_uuid(&subject_id)?,
          calibrated_score,
          converted_score,
        })
      })
      .collect()
  }
}

// ─── Transaction bodies ──────────────────────────────────────────────────────

fn load_definition(
  conn: &rusqlite::Connection,
  counter_id: Uuid,
) -> Result<Option<CounterDefinition>> {
  let json: Option<String> = conn
    .query_row(
      "SELECT definition_json FROM counters WHERE counter_id = ?1",
      rusqlite::params![encode_uuid(counter_id)],
      |row| row.get(0),
    )
    .optional()?;
  json.as_deref().map(decode_definition).transpose()
}

fn load_state(
  conn: &rusqlite::Connection,
  subject_id: Uuid,
  counter_id: Uuid,
) -> Result<Option<CounterRuntimeState>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {} FROM runtime_states rs WHERE rs.subject_id = ?1 AND rs.counter_id = ?2",
        RawRuntimeState::COLUMNS
      ),
      rusqlite::params![encode_uuid(subject_id), encode_uuid(counter_id)],
      RawRuntimeState::from_row,
    )
    .optional()?;
  raw.map(RawRuntimeState::into_state).transpose()
}

/// Read the persisted state, decide and write under one immediate
/// transaction. Concurrent writers queue on the database lock.
fn attempt_in_tx(
  conn: &mut rusqlite::Connection,
  request: TallyRequest,
  event_id: Uuid,
) -> Result<(CounterDefinition, Admission)> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let definition = load_definition(&tx, request.counter_id)?
    .ok_or(tally_core::Error::CounterNotFound(request.counter_id))?;
  let state = load_state(&tx, request.subject_id, request.counter_id)?;

  // A rejection returns early; dropping `tx` rolls back.
  let admission =
    cooldown::admit(&definition, state.as_ref(), request.subject_id, event_id, request.at)?;

  let event = &admission.event;
  tx.execute(
    "INSERT INTO tally_events (event_id, subject_id, counter_id, recorded_at, applied_increment)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    rusqlite::params![
      encode_uuid(event.event_id),
      encode_uuid(event.subject_id),
      encode_uuid(event.counter_id),
      encode_dt(event.recorded_at),
      event.applied_increment,
    ],
  )?;

  let state = &admission.state;
  tx.execute(
    "INSERT INTO runtime_states (subject_id, counter_id, raw_count, last_accepted_at)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (subject_id, counter_id) DO UPDATE SET
       raw_count        = excluded.raw_count,
       last_accepted_at = excluded.last_accepted_at",
    rusqlite::params![
      encode_uuid(state.subject_id),
      encode_uuid(state.counter_id),
      state.raw_count,
      state.last_accepted_at.map(encode_dt),
    ],
  )?;

  tx.commit()?;
  Ok((definition, admission))
}

fn retract_in_tx(
  conn: &mut rusqlite::Connection,
  retraction: &TallyRetraction,
) -> Result<()> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let event_id_str = encode_uuid(retraction.event_id);

  let event: Option<(String, String, f64)> = tx
    .query_row(
      "SELECT subject_id, counter_id, applied_increment FROM tally_events WHERE event_id = ?1",
      rusqlite::params![event_id_str],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .optional()?;
  let Some((subject_id, counter_id, applied_increment)) = event else {
    return Err(Error::EventNotFound(retraction.event_id));
  };

  let already: bool = tx
    .query_row(
      "SELECT 1 FROM tally_retractions WHERE event_id = ?1",
      rusqlite::params![event_id_str],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  if already {
    return Err(Error::AlreadyRetracted(retraction.event_id));
  }

  tx.execute(
    "INSERT INTO tally_retractions (retraction_id, event_id, reason, recorded_at)
     VALUES (?1, ?2, ?3, ?4)",
    rusqlite::params![
      encode_uuid(retraction.retraction_id),
      event_id_str,
      retraction.reason,
      encode_dt(retraction.recorded_at),
    ],
  )?;

  // The cooldown clock is left alone: a retraction is a correction, not a tap.
  tx.execute(
    "UPDATE runtime_states SET raw_count = raw_count - ?3
     WHERE subject_id = ?1 AND counter_id = ?2",
    rusqlite::params![subject_id, counter_id, applied_increment],
  )?;

  tx.commit()?;
  Ok(())
}

fn commit_in_tx(
  conn: &mut rusqlite::Connection,
  plan: &TransferPlan,
  at: DateTime<Utc>,
) -> Result<()> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let at_str = encode_dt(at);
  {
    let mut stmt = tx.prepare(
      "INSERT INTO instrument_scores (
         instrument_record_id, subject_id, calibrated_score, converted_score,
         counter_scale, instrument_max, committed_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
       ON CONFLICT (instrument_record_id) DO UPDATE SET
         subject_id       = excluded.subject_id,
         calibrated_score = excluded.calibrated_score,
         converted_score  = excluded.converted_score,
         counter_scale    = excluded.counter_scale,
         instrument_max   = excluded.instrument_max,
         committed_at     = excluded.committed_at",
    )?;
    for entry in &plan.entries {
      stmt.execute(rusqlite::params![
        entry.instrument_record_id,
        encode_uuid(entry.subject_id),
        entry.calibrated_score,
        entry.converted_score,
        plan.counter_scale,
        plan.instrument_max,
        at_str,
      ])?;
    }
  }
  tx.commit()?;
  Ok(())
}

// ─── TallyLedger impl ────────────────────────────────────────────────────────

impl TallyLedger for SqliteStore {
  type Error = Error;

  // ── Counter definitions ───────────────────────────────────────────────────

  async fn put_counter(&self, definition: CounterDefinition) -> Result<CounterDefinition> {
    let id_str         = encode_uuid(definition.counter_id);
    let collection_str = encode_uuid(definition.collection_id);
    let counter_type   = definition.counter_type.clone();
    let json           = encode_definition(&definition)?;
    let at_str         = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO counters (counter_id, collection_id, counter_type, definition_json, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (counter_id) DO UPDATE SET
             collection_id   = excluded.collection_id,
             counter_type    = excluded.counter_type,
             definition_json = excluded.definition_json,
             updated_at      = excluded.updated_at",
          rusqlite::params![id_str, collection_str, counter_type, json, at_str],
        )?;
        Ok(())
      })
      .await?;

    tracing::debug!(counter_id = %definition.counter_id, "counter definition stored");
    Ok(definition)
  }

  async fn get_counter(&self, counter_id: Uuid) -> Result<Option<CounterDefinition>> {
    self.conn.call(move |conn| Ok(load_definition(conn, counter_id))).await?
  }

  async fn list_counters(
    &self,
    collection_id: Uuid,
    counter_type: Option<String>,
  ) -> Result<Vec<CounterDefinition>> {
    let collection_str = encode_uuid(collection_id);

    let jsons: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT definition_json FROM counters
           WHERE collection_id = ?1
             AND (?2 IS NULL OR counter_type = ?2)
           ORDER BY counter_type, counter_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![collection_str, counter_type], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    jsons.iter().map(|json| decode_definition(json)).collect()
  }

  // ── Runtime state ─────────────────────────────────────────────────────────

  async fn get_runtime_state(
    &self,
    subject_id: Uuid,
    counter_id: Uuid,
  ) -> Result<Option<CounterRuntimeState>> {
    self.conn.call(move |conn| Ok(load_state(conn, subject_id, counter_id))).await?
  }

  async fn list_runtime_states(&self, query: &StateQuery) -> Result<Vec<CounterRuntimeState>> {
    let subject_str    = query.subject_id.map(encode_uuid);
    let counter_str    = query.counter_id.map(encode_uuid);
    let collection_str = query.collection_id.map(encode_uuid);
    let counter_type   = query.counter_type.clone();

    let raws: Vec<RawRuntimeState> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM runtime_states rs
           JOIN counters c ON c.counter_id = rs.counter_id
           WHERE (?1 IS NULL OR rs.subject_id    = ?1)
             AND (?2 IS NULL OR rs.counter_id    = ?2)
             AND (?3 IS NULL OR c.collection_id  = ?3)
             AND (?4 IS NULL OR c.counter_type   = ?4)
           ORDER BY rs.subject_id, rs.counter_id",
          RawRuntimeState::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params![subject_str, counter_str, collection_str, counter_type],
            RawRuntimeState::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRuntimeState::into_state).collect()
  }

  // ── Writes ────────────────────────────────────────────────────────────────

  async fn attempt_tally(&self, request: TallyRequest) -> Result<TallyReceipt> {
    let event_id = Uuid::new_v4();

    let outcome = self
      .conn
      .call(move |conn| Ok(attempt_in_tx(conn, request, event_id)))
      .await?;

    let (definition, admission) = match outcome {
      Ok(accepted) => accepted,
      Err(e) => {
        tracing::debug!(
          subject_id = %request.subject_id,
          counter_id = %request.counter_id,
          error = %e,
          "tally attempt refused"
        );
        return Err(e);
      }
    };

    let receipt = admission.receipt(&definition);
    tracing::info!(
      event_id = %receipt.event.event_id,
      subject_id = %request.subject_id,
      counter_id = %request.counter_id,
      raw_count = receipt.raw_count,
      "tally accepted"
    );
    Ok(receipt)
  }

  async fn retract_tally(&self, event_id: Uuid, reason: Option<String>) -> Result<TallyRetraction> {
    let retraction = TallyRetraction {
      retraction_id: Uuid::new_v4(),
      event_id,
      reason,
      recorded_at: Utc::now(),
    };

    let to_write = retraction.clone();
    self.conn.call(move |conn| Ok(retract_in_tx(conn, &to_write))).await??;

    tracing::info!(%event_id, "tally retracted");
    Ok(retraction)
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn list_events(&self, query: &EventQuery) -> Result<Vec<ResolvedTally>> {
    let subject_str       = query.subject_id.map(encode_uuid);
    let counter_str       = query.counter_id.map(encode_uuid);
    let collection_str    = query.collection_id.map(encode_uuid);
    let since_str         = query.since.map(encode_dt);
    let include_retracted = query.include_retracted;
    // SQLite treats a negative LIMIT as unbounded.
    let limit_val         = query.limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);

    let raws: Vec<RawResolvedTally> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT
             e.event_id, e.subject_id, e.counter_id, e.recorded_at, e.applied_increment,
             r.reason      AS retraction_reason,
             r.recorded_at AS retracted_at
           FROM tally_events e
           JOIN counters c               ON c.counter_id = e.counter_id
           LEFT JOIN tally_retractions r ON r.event_id   = e.event_id
           WHERE (?1 IS NULL OR e.subject_id    = ?1)
             AND (?2 IS NULL OR e.counter_id    = ?2)
             AND (?3 IS NULL OR c.collection_id = ?3)
             AND (?4 IS NULL OR e.recorded_at  >= ?4)
             AND (?5 OR r.event_id IS NULL)
           ORDER BY e.recorded_at DESC, e.event_id
           LIMIT ?6",
        )?;
        let rows = stmt
          .query_map(
            rusqlite::params![
              subject_str,
              counter_str,
              collection_str,
              since_str,
              include_retracted,
              limit_val,
            ],
            RawResolvedTally::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawResolvedTally::into_resolved).collect()
  }

  async fn list_active_days(
    &self,
    scope: &ActivityScope,
    range: DateRange,
  ) -> Result<Vec<DailyActivity>> {
    let subject_str    = scope.subject_id.map(encode_uuid);
    let counter_str    = scope.counter_id.map(encode_uuid);
    let collection_str = scope.collection_id.map(encode_uuid);
    let from_str       = range.from.map(encode_date);
    let to_str         = range.to.map(encode_date);

    let raws: Vec<RawDailyActivity> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT
             substr(e.recorded_at, 1, 10) AS day,
             SUM(CASE WHEN e.applied_increment > 0 THEN  e.applied_increment ELSE 0 END),
             SUM(CASE WHEN e.applied_increment < 0 THEN -e.applied_increment ELSE 0 END)
           FROM tally_events e
           JOIN counters c               ON c.counter_id = e.counter_id
           LEFT JOIN tally_retractions r ON r.event_id   = e.event_id
           WHERE r.event_id IS NULL
             AND (?1 IS NULL OR e.subject_id    = ?1)
             AND (?2 IS NULL OR e.counter_id    = ?2)
             AND (?3 IS NULL OR c.collection_id = ?3)
             AND (?4 IS NULL OR substr(e.recorded_at, 1, 10) >= ?4)
             AND (?5 IS NULL OR substr(e.recorded_at, 1, 10) <= ?5)
           GROUP BY day
           ORDER BY day",
        )?;
        let rows = stmt
          .query_map(
            rusqlite::params![subject_str, counter_str, collection_str, from_str, to_str],
            |row| {
              Ok(RawDailyActivity {
                day:          row.get(0)?,
                positive_sum: row.get(1)?,
                negative_sum: row.get(2)?,
              })
            },
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawDailyActivity::into_activity).collect()
  }
}

// ─── GradeSink impl ──────────────────────────────────────────────────────────

impl GradeSink for SqliteStore {
  type Error = Error;

  async fn commit(&self, plan: &TransferPlan) -> Result<()> {
    let plan = plan.clone();
    let entries = plan.entries.len();
    self.conn.call(move |conn| Ok(commit_in_tx(conn, &plan, Utc::now()))).await??;

    tracing::info!(entries, "transfer plan committed");
    Ok(())
  }
}
