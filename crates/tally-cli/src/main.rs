//! `tally`: drive the counter engine against a local SQLite ledger.
//!
//! # Usage
//!
//! ```
//! tally --config tally.toml sync
//! tally duplicate <UUID> --label "Participation B"
//! tally tap --subject <UUID> --counter <UUID>
//! tally trend --collection <UUID> --subject <UUID>
//! tally transfer --collection <UUID> --record <SUBJECT>=<ROW> --instrument-max 20 --confirm
//! ```
//!
//! Reports are printed to stdout as JSON; logs go to stderr.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tally_core::ledger::{ActivityScope, EventQuery, TallyRequest};
use tally_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
  commands::TransferArgs,
  config::AppConfig,
};

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Cooldown-gated counters with calibrated scores")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tally.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

/// Which tallies feed a window report.
#[derive(Args, Debug)]
struct ScopeArgs {
  #[arg(long)]
  collection: Option<Uuid>,
  #[arg(long)]
  subject:    Option<Uuid>,
  #[arg(long)]
  counter:    Option<Uuid>,
}

impl From<ScopeArgs> for ActivityScope {
  fn from(args: ScopeArgs) -> Self {
    Self { collection_id: args.collection, subject_id: args.subject, counter_id: args.counter }
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Register the configured counters and report definition warnings.
  Sync,

  /// Copy a counter's configuration under a new id; tallies are not copied.
  Duplicate {
    counter: Uuid,
    #[arg(long)]
    label:   String,
  },

  /// Attempt one tally.
  Tap {
    #[arg(long)]
    subject: Uuid,
    #[arg(long)]
    counter: Uuid,
    /// Attempt time (RFC 3339); defaults to now.
    #[arg(long)]
    at:      Option<DateTime<Utc>>,
  },

  /// Current counts, scores and cooldowns of a subject.
  Status {
    #[arg(long)]
    subject: Uuid,
    #[arg(long)]
    counter: Option<Uuid>,
    #[arg(long)]
    at:      Option<DateTime<Utc>>,
  },

  /// Tally events, newest first.
  History {
    #[arg(long)]
    subject:           Option<Uuid>,
    #[arg(long)]
    counter:           Option<Uuid>,
    #[arg(long)]
    collection:        Option<Uuid>,
    #[arg(long)]
    since:             Option<DateTime<Utc>>,
    #[arg(long)]
    limit:             Option<usize>,
    #[arg(long)]
    include_retracted: bool,
  },

  /// Withdraw a tally event.
  Retract {
    event: Uuid,
    #[arg(long)]
    reason: Option<String>,
  },

  /// Per-type totals of one subject.
  Summary {
    #[arg(long)]
    collection:   Uuid,
    #[arg(long)]
    subject:      Uuid,
    #[arg(long = "type")]
    counter_type: Option<String>,
  },

  /// Score statistics and usage across a collection.
  Stats {
    #[arg(long)]
    collection:   Uuid,
    #[arg(long = "type")]
    counter_type: Option<String>,
    #[arg(long, default_value_t = 5)]
    top:          usize,
  },

  /// Compare the latest window of active days with the one before.
  Trend {
    #[command(flatten)]
    scope:  ScopeArgs,
    #[arg(long)]
    today:  Option<NaiveDate>,
    /// Active days per window; defaults to `trend_window_days`.
    #[arg(long)]
    window: Option<usize>,
  },

  /// Split the history into consecutive windows of active days.
  Balance {
    #[command(flatten)]
    scope:  ScopeArgs,
    #[arg(long)]
    today:  Option<NaiveDate>,
    /// Active days per chunk; defaults to `chunk_window_days`.
    #[arg(long)]
    window: Option<usize>,
  },

  /// Convert calibrated scores into an instrument's scale.
  Transfer {
    #[arg(long)]
    collection:     Uuid,
    #[arg(long = "type")]
    counter_type:   Option<String>,
    /// `SUBJECT=RECORD`, repeatable.
    #[arg(long = "record", value_parser = parse_record, required = true)]
    records:        Vec<(Uuid, String)>,
    #[arg(long)]
    counter_scale:  Option<f64>,
    #[arg(long)]
    instrument_max: f64,
    /// Write the plan; without this flag it is only printed.
    #[arg(long)]
    confirm:        bool,
  },

  /// Evaluate a calibration model without touching the store.
  Calibrate {
    model:  String,
    raw:    f64,
    /// Model parameters as JSON.
    #[arg(long, default_value = "{}")]
    params: String,
  },
}

fn parse_record(s: &str) -> Result<(Uuid, String), String> {
  let (subject, record) = s
    .split_once('=')
    .ok_or_else(|| format!("expected SUBJECT=RECORD, got {s:?}"))?;
  let subject = Uuid::parse_str(subject.trim()).map_err(|e| e.to_string())?;
  let record = record.trim();
  if record.is_empty() {
    return Err("instrument record id is empty".into());
  }
  Ok((subject, record.to_owned()))
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Pure evaluation needs neither config nor store.
  if let Command::Calibrate { model, raw, params } = &cli.command {
    let params: serde_json::Value =
      serde_json::from_str(params).context("--params is not valid JSON")?;
    return print_json(&commands::calibrate(model, &params, *raw));
  }

  let cfg = AppConfig::load(&cli.config)?;
  if let Some(parent) = cfg.store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;

  let now = Utc::now();
  let today = now.date_naive();

  match cli.command {
    Command::Sync => print_json(&commands::sync(&store, &cfg.counters).await?),
    Command::Duplicate { counter, label } => {
      print_json(&commands::duplicate(&store, counter, label).await?)
    }
    Command::Tap { subject, counter, at } => {
      let request = TallyRequest { subject_id: subject, counter_id: counter, at: at.unwrap_or(now) };
      print_json(&commands::tap(&store, request).await?)
    }
    Command::Status { subject, counter, at } => {
      print_json(&commands::status(&store, subject, counter, at.unwrap_or(now)).await?)
    }
    Command::History { subject, counter, collection, since, limit, include_retracted } => {
      let query = EventQuery {
        subject_id: subject,
        counter_id: counter,
        collection_id: collection,
        since,
        include_retracted,
        limit,
      };
      print_json(&commands::history(&store, &query).await?)
    }
    Command::Retract { event, reason } => print_json(&commands::retract(&store, event, reason).await?),
    Command::Summary { collection, subject, counter_type } => {
      print_json(&commands::summary(&store, collection, subject, counter_type).await?)
    }
    Command::Stats { collection, counter_type, top } => {
      print_json(&commands::stats(&store, collection, counter_type, top).await?)
    }
    Command::Trend { scope, today: at, window } => {
      let window = window.unwrap_or(cfg.trend_window_days);
      let report = commands::trend(&store, &scope.into(), at.unwrap_or(today), window).await?;
      print_json(&report)
    }
    Command::Balance { scope, today: at, window } => {
      let window = window.unwrap_or(cfg.chunk_window_days);
      let report = commands::balance(&store, &scope.into(), at.unwrap_or(today), window).await?;
      print_json(&report)
    }
    Command::Transfer {
      collection,
      counter_type,
      records,
      counter_scale,
      instrument_max,
      confirm,
    } => {
      let args = TransferArgs {
        collection_id: collection,
        counter_type,
        records,
        counter_scale,
        instrument_max,
        confirm,
      };
      print_json(&commands::transfer(&store, args).await?)
    }
    Command::Calibrate { .. } => Ok(()),
  }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
