use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{MINUTE_MS, Ms};

/// Runtime knobs for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the write-ahead log.
    pub data_dir: PathBuf,
    /// Default lifetime of a reservation lock.
    pub lock_ttl_ms: Ms,
    /// How often the reaper sweeps expired locks.
    pub reaper_interval_ms: u64,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    /// Reject staff bookings that fall outside the effective working window.
    pub enforce_working_hours: bool,
    /// Port for the Prometheus exporter; `None` disables it.
    pub metrics_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_ttl_ms: 10 * MINUTE_MS,
            reaper_interval_ms: 5_000,
            compact_threshold: 1_000,
            enforce_working_hours: false,
            metrics_port: None,
        }
    }
}

impl EngineConfig {
    /// Read `CHAIRBOOK_*` variables, falling back to defaults for anything
    /// missing or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("CHAIRBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_ttl_ms: parsed(&lookup, "CHAIRBOOK_LOCK_TTL_MS").unwrap_or(defaults.lock_ttl_ms),
            reaper_interval_ms: parsed(&lookup, "CHAIRBOOK_REAPER_INTERVAL_MS")
                .unwrap_or(defaults.reaper_interval_ms),
            compact_threshold: parsed(&lookup, "CHAIRBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            enforce_working_hours: lookup("CHAIRBOOK_ENFORCE_WORKING_HOURS")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.enforce_working_hours),
            metrics_port: parsed(&lookup, "CHAIRBOOK_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("chairbook.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
