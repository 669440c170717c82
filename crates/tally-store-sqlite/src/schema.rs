//! SQL schema for the tally SQLite store.
//!
//! Executed once per connection at startup. Migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Counter definitions, upserted from configuration.
CREATE TABLE IF NOT EXISTS counters (
    counter_id      TEXT PRIMARY KEY,
    collection_id   TEXT NOT NULL,
    counter_type    TEXT NOT NULL,
    definition_json TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- One accumulator per (subject, counter); created on first accepted tally.
CREATE TABLE IF NOT EXISTS runtime_states (
    subject_id       TEXT NOT NULL,
    counter_id       TEXT NOT NULL REFERENCES counters(counter_id),
    raw_count        REAL NOT NULL,
    last_accepted_at TEXT,
    PRIMARY KEY (subject_id, counter_id)
);

-- Tally events are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS tally_events (
    event_id          TEXT PRIMARY KEY,
    subject_id        TEXT NOT NULL,
    counter_id        TEXT NOT NULL REFERENCES counters(counter_id),
    recorded_at       TEXT NOT NULL,   -- RFC 3339 UTC, fixed microsecond width
    applied_increment REAL NOT NULL
);

-- A tally withdrawn by an external correction.
CREATE TABLE IF NOT EXISTS tally_retractions (
    retraction_id TEXT PRIMARY KEY,
    event_id      TEXT NOT NULL REFERENCES tally_events(event_id),
    reason        TEXT,
    recorded_at   TEXT NOT NULL,
    UNIQUE (event_id)
);

-- Converted scores handed to the grading instrument.
CREATE TABLE IF NOT EXISTS instrument_scores (
    instrument_record_id TEXT PRIMARY KEY,
    subject_id           TEXT NOT NULL,
    calibrated_score     REAL NOT NULL,
    converted_score      REAL NOT NULL,
    counter_scale        REAL NOT NULL,
    instrument_max       REAL NOT NULL,
    committed_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS counters_collection_idx ON counters(collection_id, counter_type);
CREATE INDEX IF NOT EXISTS events_pair_idx         ON tally_events(subject_id, counter_id);
CREATE INDEX IF NOT EXISTS events_counter_idx      ON tally_events(counter_id);
CREATE INDEX IF NOT EXISTS events_recorded_idx     ON tally_events(recorded_at);

PRAGMA user_version = 1;
";
