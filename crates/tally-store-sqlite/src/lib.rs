//! SQLite ledger for the tally engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Admission decisions are made inside
//! `BEGIN IMMEDIATE` transactions against the persisted runtime state.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
