//! Application configuration: a TOML file layered under `TALLY_`-prefixed
//! environment variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use tally_core::{
  counter::CounterDefinition,
  window::{BALANCE_CHUNK_DAYS, TREND_WINDOW_DAYS},
};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  #[serde(default = "default_store_path")]
  pub store_path:        PathBuf,
  #[serde(default = "default_trend_window_days")]
  pub trend_window_days: usize,
  #[serde(default = "default_chunk_window_days")]
  pub chunk_window_days: usize,
  /// Definitions registered by `tally sync`.
  #[serde(default)]
  pub counters:          Vec<CounterDefinition>,
}

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/tally/tally.db") }

fn default_trend_window_days() -> usize { TREND_WINDOW_DAYS }

fn default_chunk_window_days() -> usize { BALANCE_CHUNK_DAYS }

impl AppConfig {
  /// Read `path` (optional) and the environment. `~` in `store_path` is
  /// expanded.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path.to_path_buf()).required(false))
      .add_source(config::Environment::with_prefix("TALLY"))
      .build()
      .with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut cfg: AppConfig = settings
      .try_deserialize()
      .context("failed to deserialise AppConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    Ok(cfg)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
