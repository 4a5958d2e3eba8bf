//! # Durability Configuration
//!
//! Purpose: Collect the persistence knobs shared by the cache node and the
//! discovery service, with their environment-variable mirrors.
//!
//! ## Notes
//! - `SNAPSHOT_INTERVAL` accepts an ISO-8601 duration (`PT5M`, `PT90S`,
//!   `P1DT2H`); `WAL_FLUSH_INTERVAL` accepts the same or a bare millisecond
//!   count. Both fall back to their defaults when unset.
//! - Path layout: `<data_dir>/<node_id>/wal/<node_id>.wal` and
//!   `<data_dir>/<node_id>/snapshots/<node_id>_<epochMs>.snapshot`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EmberError, EmberResult};
use crate::types::NodeId;

/// Env var mirroring `--persistence-enabled`.
pub const ENV_PERSISTENCE_ENABLED: &str = "PERSISTENCE_ENABLED";
/// Env var mirroring `--data-dir`.
pub const ENV_DATA_DIR: &str = "DATA_DIR";
/// Snapshot cadence, ISO-8601 duration.
pub const ENV_SNAPSHOT_INTERVAL: &str = "SNAPSHOT_INTERVAL";
/// Upper bound between WAL fsyncs.
pub const ENV_WAL_FLUSH_INTERVAL: &str = "WAL_FLUSH_INTERVAL";
/// Hard cap on the serialized snapshot body, in bytes.
pub const ENV_MAX_SNAPSHOT_SIZE: &str = "MAX_SNAPSHOT_SIZE";

/// Persistence settings for one node.
#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Master switch; when off the WAL and snapshot store are never opened.
    pub enabled: bool,
    /// Root directory holding one subdirectory per node id.
    pub data_dir: PathBuf,
    /// Cadence of the background snapshot scheduler.
    pub snapshot_interval: Duration,
    /// Maximum time a flushed-but-not-synced WAL write may wait for fsync.
    pub wal_fsync_interval: Duration,
    /// Snapshots kept by the retention pass.
    pub snapshot_retain: usize,
    /// Optional cap on snapshot body size; an over-limit dump fails the
    /// snapshot and leaves the WAL untouched.
    pub max_snapshot_bytes: Option<u64>,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        DurabilityConfig {
            enabled: false,
            data_dir: PathBuf::from("./data"),
            snapshot_interval: Duration::from_secs(300),
            wal_fsync_interval: Duration::from_millis(1000),
            snapshot_retain: 3,
            max_snapshot_bytes: None,
        }
    }
}

impl DurabilityConfig {
    /// Applies the environment-variable mirrors on top of `self`.
    ///
    /// Flags parsed earlier (clap) win only where the env var is unset, so
    /// callers overlay env first and CLI second.
    pub fn overlay_env(mut self) -> EmberResult<Self> {
        if let Some(raw) = read_env(ENV_PERSISTENCE_ENABLED) {
            self.enabled = parse_bool(&raw)
                .ok_or_else(|| EmberError::Config(format!("{ENV_PERSISTENCE_ENABLED}={raw}")))?;
        }
        if let Some(raw) = read_env(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(raw);
        }
        if let Some(raw) = read_env(ENV_SNAPSHOT_INTERVAL) {
            self.snapshot_interval = parse_iso8601_duration(&raw)
                .ok_or_else(|| EmberError::Config(format!("{ENV_SNAPSHOT_INTERVAL}={raw}")))?;
        }
        if let Some(raw) = read_env(ENV_WAL_FLUSH_INTERVAL) {
            self.wal_fsync_interval = parse_flush_interval(&raw)
                .ok_or_else(|| EmberError::Config(format!("{ENV_WAL_FLUSH_INTERVAL}={raw}")))?;
        }
        if let Some(raw) = read_env(ENV_MAX_SNAPSHOT_SIZE) {
            let bytes: u64 = raw
                .parse()
                .map_err(|_| EmberError::Config(format!("{ENV_MAX_SNAPSHOT_SIZE}={raw}")))?;
            self.max_snapshot_bytes = Some(bytes);
        }
        Ok(self)
    }

    /// Directory owned by one node under the data root.
    pub fn node_dir(&self, node_id: &NodeId) -> PathBuf {
        self.data_dir.join(node_id.as_str())
    }

    /// Write-ahead log file for a node.
    pub fn wal_path(&self, node_id: &NodeId) -> PathBuf {
        self.node_dir(node_id)
            .join("wal")
            .join(format!("{}.wal", node_id))
    }

    /// Snapshot directory for a node.
    pub fn snapshot_dir(&self, node_id: &NodeId) -> PathBuf {
        self.node_dir(node_id).join("snapshots")
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Accepts ISO-8601 or a bare integer of milliseconds.
fn parse_flush_interval(raw: &str) -> Option<Duration> {
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse::<u64>().ok().map(Duration::from_millis);
    }
    parse_iso8601_duration(raw)
}

/// Parses an ISO-8601 duration such as `PT5M`, `PT1.5S`, or `P1DT2H30M`.
///
/// Calendar units larger than a day (years, months, weeks) are rejected; a
/// cache cadence has no business being calendar-relative.
pub fn parse_iso8601_duration(raw: &str) -> Option<Duration> {
    let rest = raw.strip_prefix('P').or_else(|| raw.strip_prefix('p'))?;
    let (date_part, time_part) = match rest.split_once(['T', 't']) {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if date_part.is_empty() && time_part.map_or(true, str::is_empty) {
        return None;
    }

    let mut total = Duration::ZERO;
    for (value, unit) in iso_components(date_part)? {
        let seconds = match unit {
            'D' => 86_400.0,
            _ => return None,
        };
        total += Duration::try_from_secs_f64(value * seconds).ok()?;
    }
    if let Some(time_part) = time_part {
        for (value, unit) in iso_components(time_part)? {
            let seconds = match unit {
                'H' => 3_600.0,
                'M' => 60.0,
                'S' => 1.0,
                _ => return None,
            };
            total += Duration::try_from_secs_f64(value * seconds).ok()?;
        }
    }
    Some(total)
}

/// Splits `12H30M` into `[(12.0, 'H'), (30.0, 'M')]`.
fn iso_components(part: &str) -> Option<Vec<(f64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            digits.push(ch);
        } else {
            if digits.is_empty() {
                return None;
            }
            let value: f64 = digits.parse().ok()?;
            if !value.is_finite() || value < 0.0 {
                return None;
            }
            out.push((value, ch.to_ascii_uppercase()));
            digits.clear();
        }
    }
    // Trailing digits without a unit letter are malformed.
    if !digits.is_empty() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(
            parse_iso8601_duration("PT5M"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            parse_iso8601_duration("PT90S"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_iso8601_duration("P1DT2H"),
            Some(Duration::from_secs(86_400 + 7_200))
        );
        assert_eq!(
            parse_iso8601_duration("PT0.5S"),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_iso8601_duration(""), None);
        assert_eq!(parse_iso8601_duration("P"), None);
        assert_eq!(parse_iso8601_duration("PT"), None);
        assert_eq!(parse_iso8601_duration("5M"), None);
        assert_eq!(parse_iso8601_duration("PT5"), None);
        assert_eq!(parse_iso8601_duration("P1Y"), None);
    }

    #[test]
    fn flush_interval_accepts_bare_millis() {
        assert_eq!(
            parse_flush_interval("250"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_flush_interval("PT2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_flush_interval("soon"), None);
    }

    #[test]
    fn paths_follow_node_layout() {
        let cfg = DurabilityConfig {
            data_dir: PathBuf::from("/var/ember"),
            ..DurabilityConfig::default()
        };
        let node = NodeId::from("cache-2");
        assert_eq!(
            cfg.wal_path(&node),
            Path::new("/var/ember/cache-2/wal/cache-2.wal")
        );
        assert_eq!(
            cfg.snapshot_dir(&node),
            Path::new("/var/ember/cache-2/snapshots")
        );
    }
}
