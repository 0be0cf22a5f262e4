//! Configuration module for kilnwatch.
//!
//! Loads configuration from environment variables with defaults. The plant
//! layout itself lives in a JSON file (see [`crate::layout::PlantConfig`]).

use crate::poller::PollerConfig;
use crate::report::{CounterResetPolicy, ReportSettings};

use chrono::FixedOffset;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "kilnwatch.db")
    pub db_path: String,
    /// Plant layout file; the built-in workshop layout is used when unset.
    pub plant_path: Option<String>,
    /// Seconds between two polls of a controller (default: 6)
    pub poll_interval_secs: f64,
    /// Seconds before a connect or block read counts as failed (default: 5)
    pub read_timeout_secs: f64,
    /// Seconds a report may spend on one device's store queries (default: 10)
    pub query_timeout_secs: f64,
    /// Offset of the plant's local time from UTC, for calendar days (default: 0)
    pub utc_offset_minutes: i32,
    pub counter_reset: CounterResetPolicy,
    /// Poll simulated controllers instead of real ones.
    pub simulate: bool,
    /// Probability of an injected failure per simulated connect/read.
    pub sim_error_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "kilnwatch.db".to_string(),
            plant_path: None,
            poll_interval_secs: 6.0,
            read_timeout_secs: 5.0,
            query_timeout_secs: 10.0,
            utc_offset_minutes: 0,
            counter_reset: CounterResetPolicy::SurfaceRaw,
            simulate: false,
            sim_error_rate: 0.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KILNWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `KILNWATCH_DB_PATH`: Database file path (default: "kilnwatch.db")
    /// - `KILNWATCH_PLANT_PATH`: Plant layout JSON file
    /// - `KILNWATCH_POLL_INTERVAL`: Poll interval in seconds (default: 6)
    /// - `KILNWATCH_READ_TIMEOUT`: Field-bus timeout in seconds (default: 5)
    /// - `KILNWATCH_QUERY_TIMEOUT`: Report query timeout in seconds (default: 10)
    /// - `KILNWATCH_UTC_OFFSET_MINUTES`: Local time offset (default: 0)
    /// - `KILNWATCH_COUNTER_RESET`: `raw` or `zero-baseline` (default: raw)
    /// - `KILNWATCH_SIMULATE`: `true` to poll simulated controllers
    /// - `KILNWATCH_SIM_ERROR_RATE`: Simulated failure probability (default: 0)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        parse_into(&lookup, "KILNWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("KILNWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        cfg.plant_path = lookup("KILNWATCH_PLANT_PATH").filter(|p| !p.is_empty());
        parse_into(&lookup, "KILNWATCH_POLL_INTERVAL", &mut cfg.poll_interval_secs);
        parse_into(&lookup, "KILNWATCH_READ_TIMEOUT", &mut cfg.read_timeout_secs);
        parse_into(&lookup, "KILNWATCH_QUERY_TIMEOUT", &mut cfg.query_timeout_secs);
        parse_into(&lookup, "KILNWATCH_UTC_OFFSET_MINUTES", &mut cfg.utc_offset_minutes);
        parse_into(&lookup, "KILNWATCH_COUNTER_RESET", &mut cfg.counter_reset);
        parse_into(&lookup, "KILNWATCH_SIMULATE", &mut cfg.simulate);
        parse_into(&lookup, "KILNWATCH_SIM_ERROR_RATE", &mut cfg.sim_error_rate);

        let defaults = Self::default();
        keep_valid_secs(
            "KILNWATCH_POLL_INTERVAL",
            &mut cfg.poll_interval_secs,
            defaults.poll_interval_secs,
        );
        keep_valid_secs(
            "KILNWATCH_READ_TIMEOUT",
            &mut cfg.read_timeout_secs,
            defaults.read_timeout_secs,
        );
        keep_valid_secs(
            "KILNWATCH_QUERY_TIMEOUT",
            &mut cfg.query_timeout_secs,
            defaults.query_timeout_secs,
        );
        if FixedOffset::east_opt(cfg.utc_offset_minutes.saturating_mul(60)).is_none() {
            tracing::warn!("Ignoring UTC offset of {} minutes", cfg.utc_offset_minutes);
            cfg.utc_offset_minutes = 0;
        }
        if cfg.sim_error_rate.is_nan() {
            tracing::warn!("Ignoring KILNWATCH_SIM_ERROR_RATE=NaN");
            cfg.sim_error_rate = defaults.sim_error_rate;
        }
        cfg.sim_error_rate = cfg.sim_error_rate.clamp(0.0, 1.0);

        cfg
    }

    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Offset::fix(&chrono::Utc))
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs_f64(self.poll_interval_secs),
            read_timeout: Duration::from_secs_f64(self.read_timeout_secs),
            ..Default::default()
        }
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            poll_interval: Duration::from_secs_f64(self.poll_interval_secs),
            utc_offset: self.utc_offset(),
            counter_reset: self.counter_reset,
            query_timeout: Duration::from_secs_f64(self.query_timeout_secs),
        }
    }
}

/// Shortest accepted interval or timeout, in seconds.
const MIN_SECS: f64 = 0.001;
/// Longest accepted interval or timeout, in seconds.
const MAX_SECS: f64 = 86_400.0;

/// Reset a duration in seconds to `default` unless it is finite and within
/// [`MIN_SECS`, `MAX_SECS`].
fn keep_valid_secs(key: &str, value: &mut f64, default: f64) {
    if !(MIN_SECS..=MAX_SECS).contains(value) {
        tracing::warn!("Ignoring {}={}, using {}", key, value, default);
        *value = default;
    }
}

/// Overwrite `target` with a parsed variable; bad values keep the default.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "kilnwatch.db");
        assert_eq!(cfg.poll_interval_secs, 6.0);
        assert!(!cfg.simulate);
    }

    #[test]
    fn test_overrides() {
        let cfg = load_from(&[
            ("KILNWATCH_HTTP_PORT", "9090"),
            ("KILNWATCH_PLANT_PATH", "/etc/kilnwatch/plant.json"),
            ("KILNWATCH_POLL_INTERVAL", "2.5"),
            ("KILNWATCH_UTC_OFFSET_MINUTES", "480"),
            ("KILNWATCH_COUNTER_RESET", "zero-baseline"),
            ("KILNWATCH_SIMULATE", "true"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.plant_path.as_deref(), Some("/etc/kilnwatch/plant.json"));
        assert_eq!(cfg.poller_config().interval, Duration::from_millis(2500));
        assert_eq!(cfg.utc_offset().local_minus_utc(), 8 * 3600);
        assert_eq!(cfg.counter_reset, CounterResetPolicy::ResetToZeroBaseline);
        assert!(cfg.simulate);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load_from(&[
            ("KILNWATCH_HTTP_PORT", "eighty"),
            ("KILNWATCH_POLL_INTERVAL", "-1"),
            ("KILNWATCH_UTC_OFFSET_MINUTES", "100000"),
            ("KILNWATCH_COUNTER_RESET", "clamp"),
            ("KILNWATCH_SIM_ERROR_RATE", "4"),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.poll_interval_secs, 6.0);
        assert_eq!(cfg.utc_offset_minutes, 0);
        assert_eq!(cfg.counter_reset, CounterResetPolicy::SurfaceRaw);
        assert_eq!(cfg.sim_error_rate, 1.0);
    }

    #[test]
    fn test_unusable_durations_keep_defaults() {
        for bad in ["NaN", "inf", "-inf", "0", "0.0000001", "1e30"] {
            let cfg = load_from(&[
                ("KILNWATCH_POLL_INTERVAL", bad),
                ("KILNWATCH_READ_TIMEOUT", bad),
                ("KILNWATCH_QUERY_TIMEOUT", bad),
                ("KILNWATCH_SIM_ERROR_RATE", bad),
            ]);
            assert_eq!(cfg.poll_interval_secs, 6.0, "{}", bad);
            assert_eq!(cfg.read_timeout_secs, 5.0, "{}", bad);
            assert_eq!(cfg.query_timeout_secs, 10.0, "{}", bad);
            assert!((0.0..=1.0).contains(&cfg.sim_error_rate), "{}", bad);

            // building durations from them must not panic
            let poller = cfg.poller_config();
            assert_eq!(poller.interval, Duration::from_secs(6));
            assert_eq!(cfg.report_settings().query_timeout, Duration::from_secs(10));
        }

        let cfg = load_from(&[("KILNWATCH_READ_TIMEOUT", "0.25")]);
        assert_eq!(cfg.poller_config().read_timeout, Duration::from_millis(250));
    }
}
