//! SchedulerConfig: layered configuration (file -> environment -> CLI),
//! and the SchedulerContext that replaces module-level global state.
//!
//! Grounded in the teacher's workspace dependency on the `config` crate
//! paired with `clap`'s `env` feature — the standard file-then-env-then-flag
//! precedence that pairing implies.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSetting {
    pub members: Vec<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// ISO-8601 interval bounding how far ahead of the oldest active cycle
    /// point the pool may spawn.
    pub runahead_limit: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default)]
    pub queues: HashMap<String, QueueSetting>,
    #[serde(default = "default_queue_limit")]
    pub default_queue_limit: usize,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_queue_limit() -> usize {
    usize::MAX
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            runahead_limit: "P0D".to_string(),
            tick_interval_ms: default_tick_interval_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            queues: HashMap::new(),
            default_queue_limit: default_queue_limit(),
            store_path: None,
        }
    }
}

/// CLI flags, layered over a config file and `CYLC_`-prefixed environment
/// variables by `SchedulerConfig::load`.
#[derive(Debug, Parser)]
#[command(name = "cylc-scheduler", about = "Cycling workflow scheduling engine")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "CYLC_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "CYLC_RUNAHEAD_LIMIT")]
    pub runahead_limit: Option<String>,

    #[arg(long, env = "CYLC_TICK_INTERVAL_MS")]
    pub tick_interval_ms: Option<u64>,

    #[arg(long, env = "CYLC_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// JSON file describing the suite's `TaskDefinition`s (the core has no
    /// graph-language parser of its own — see spec.md §1 out-of-scope).
    #[arg(long, env = "CYLC_SUITE_FILE")]
    pub suite_file: PathBuf,

    /// Initial cycle point. Prefix `i` for an integer point (e.g. `i1`),
    /// otherwise parsed as a Gregorian `CyclePoint`.
    #[arg(long, env = "CYLC_ICP")]
    pub icp: String,
}

impl SchedulerConfig {
    /// Layer a config file (if present) under environment variables and CLI
    /// flags (if given), file < env < flag.
    pub fn load(cli: &Cli) -> SchedulerResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config_file {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("CYLC").separator("__"));
        let loaded = builder
            .build()
            .map_err(|e| SchedulerError::Input(format!("config error: {e}")))?;

        let mut resolved: SchedulerConfig = match loaded.try_deserialize() {
            Ok(cfg) => cfg,
            Err(_) => SchedulerConfig::default(),
        };

        if let Some(r) = &cli.runahead_limit {
            resolved.runahead_limit = r.clone();
        }
        if let Some(t) = cli.tick_interval_ms {
            resolved.tick_interval_ms = t;
        }
        if let Some(p) = &cli.store_path {
            resolved.store_path = Some(p.clone());
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.tick_interval_ms, 1000);
        assert!(cfg.queues.is_empty());
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = Cli {
            config_file: None,
            runahead_limit: Some("P3D".to_string()),
            tick_interval_ms: Some(500),
            store_path: None,
            suite_file: PathBuf::from("suite.json"),
            icp: "i1".to_string(),
        };
        let cfg = SchedulerConfig::load(&cli).unwrap();
        assert_eq!(cfg.runahead_limit, "P3D");
        assert_eq!(cfg.tick_interval_ms, 500);
    }
}
