//! Core types and pure computations for the Tally counter engine.
//!
//! This crate is deliberately free of database and transport dependencies.
//! Every operation takes the caller's identity and the current time as
//! explicit arguments; the only I/O seams are the [`ledger`] traits, which
//! storage backends (e.g. `tally-store-sqlite`) implement.

// Ledger traits spell out `Send` on their returned futures; implementors may
// still write plain `async fn`.
#![allow(async_fn_in_trait)]

pub mod aggregate;
pub mod calibration;
pub mod cooldown;
pub mod counter;
pub mod error;
pub mod forgetting;
pub mod ledger;
pub mod window;

pub use error::{Error, Result};

/// Round to the two-decimal precision used for reported averages.
pub(crate) fn round2(value: f64) -> f64 { (value * 100.0).round() / 100.0 }
