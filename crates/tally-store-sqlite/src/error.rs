//! Error type for `tally-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// Engine-level rejection or failure, e.g. `NotAllowed` or `CapReached`.
  #[error("core error: {0}")]
  Core(#[from] tally_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("tally event not found: {0}")]
  EventNotFound(uuid::Uuid),

  #[error("tally event {0} is already retracted")]
  AlreadyRetracted(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
