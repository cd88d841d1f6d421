//! Runtime configuration, read from `WARDSCHED_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{DAY_MS, MINUTE_MS, Ms};

/// Knobs of the allocation engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ledger_path: PathBuf,
    /// Longest a caller waits for a resource's lock before getting `Busy`.
    pub lock_timeout: Duration,
    pub min_booking_ms: Ms,
    pub max_booking_ms: Ms,
}

impl EngineConfig {
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            lock_timeout: Duration::from_millis(2_000),
            min_booking_ms: MINUTE_MS,
            max_booking_ms: 90 * DAY_MS,
        }
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn booking_bounds(mut self, min_ms: Ms, max_ms: Ms) -> Self {
        self.min_booking_ms = min_ms;
        self.max_booking_ms = max_ms;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Mark confirmed bookings completed once their end has passed.
    pub auto_complete: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            auto_complete: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineConfig,
    pub sweeper: SweeperConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = PathBuf::from(lookup("WARDSCHED_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let defaults = EngineConfig::new(data_dir.join("bookings.ledger"));
        let sweeper_defaults = SweeperConfig::default();

        let engine = EngineConfig {
            lock_timeout: Duration::from_millis(parse_or(
                &lookup,
                "WARDSCHED_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )),
            min_booking_ms: parse_or(&lookup, "WARDSCHED_MIN_BOOKING_MS", defaults.min_booking_ms),
            max_booking_ms: parse_or(&lookup, "WARDSCHED_MAX_BOOKING_MS", defaults.max_booking_ms),
            ..defaults
        };
        let sweeper = SweeperConfig {
            interval: Duration::from_millis(parse_or(
                &lookup,
                "WARDSCHED_SWEEP_INTERVAL_MS",
                sweeper_defaults.interval.as_millis() as u64,
            )),
            auto_complete: parse_or(&lookup, "WARDSCHED_AUTO_COMPLETE", sweeper_defaults.auto_complete),
        };

        Self {
            bind: lookup("WARDSCHED_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "WARDSCHED_PORT", 5433),
            data_dir,
            password: lookup("WARDSCHED_PASSWORD").unwrap_or_else(|| "wardsched".into()),
            max_connections: parse_or(&lookup, "WARDSCHED_MAX_CONNECTIONS", 256),
            metrics_port: lookup("WARDSCHED_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("WARDSCHED_TLS_CERT"),
            tls_key: lookup("WARDSCHED_TLS_KEY"),
            engine,
            sweeper,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {key}={raw:?}, using default");
            default
        }),
    }
}
