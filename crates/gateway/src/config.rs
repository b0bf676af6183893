// Gateway configuration.
//
// Every setting comes from a `FREEMONITOR_*` environment variable with a
// development default. Unparseable, zero or out-of-range values fall back
// to the default.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration as StdDuration};

use chrono::Duration;

use crate::cache::{AccessCacheConfig, DEFAULT_MAX_SIZE, DEFAULT_TTL_SECS};
use crate::gateway::{GatewaySettings, DEFAULT_INACTIVITY_SECS};
use crate::rate_limit::{DEFAULT_CONTROL_PER_MINUTE, DEFAULT_TELEMETRY_PER_MINUTE};
use crate::sink::DEFAULT_OUTBOUND_BUFFER;

const DEV_JWT_SECRET: &str = "freemonitor_local_development_jwt_secret_32_chars";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";
const DEFAULT_SWEEP_SECS: u64 = 60;

/// Upper bound for every duration setting (30 days).
const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_CACHE_SIZE: usize = 10_000_000;
const MAX_OUTBOUND_BUFFER: usize = 65_536;
const MAX_EVENTS_PER_MINUTE: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify connection tokens.
    pub jwt_secret: String,
    /// Comma-separated CORS origins, or `*`.
    pub cors_origins: String,
    pub log_filter: String,
    pub log_json: bool,
    /// JSON seed for the in-memory device/alert directory.
    pub directory_file: Option<PathBuf>,
    pub cache_max_size: usize,
    pub cache_ttl_secs: i64,
    pub cache_sweep_secs: u64,
    pub inactivity_secs: i64,
    pub reaper_interval_secs: u64,
    pub outbound_buffer: usize,
    pub telemetry_per_minute: usize,
    pub control_per_minute: usize,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FREEMONITOR_HOST` | `0.0.0.0` |
    /// | `FREEMONITOR_PORT` | `3001` |
    /// | `FREEMONITOR_JWT_SECRET` | dev-only placeholder |
    /// | `FREEMONITOR_CORS_ORIGINS` | `http://localhost:3000` |
    /// | `FREEMONITOR_LOG_FILTER` | `info` |
    /// | `FREEMONITOR_LOG_JSON` | off |
    /// | `FREEMONITOR_DIRECTORY_FILE` | *(none)* |
    /// | `FREEMONITOR_CACHE_MAX_SIZE` | `10000` |
    /// | `FREEMONITOR_CACHE_TTL_SECS` | `300` |
    /// | `FREEMONITOR_CACHE_SWEEP_SECS` | `60` |
    /// | `FREEMONITOR_INACTIVITY_SECS` | `1800` |
    /// | `FREEMONITOR_REAPER_INTERVAL_SECS` | `60` |
    /// | `FREEMONITOR_OUTBOUND_BUFFER` | `256` |
    /// | `FREEMONITOR_TELEMETRY_PER_MINUTE` | `1000` |
    /// | `FREEMONITOR_CONTROL_PER_MINUTE` | `100` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FREEMONITOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parsed(&env, "FREEMONITOR_PORT").unwrap_or(DEFAULT_PORT);

        Self {
            listen_addr: listen_addr(&host, port),
            jwt_secret: env("FREEMONITOR_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into()),
            cors_origins: env("FREEMONITOR_CORS_ORIGINS")
                .unwrap_or_else(|_| DEFAULT_CORS_ORIGINS.into()),
            log_filter: env("FREEMONITOR_LOG_FILTER").unwrap_or_else(|_| "info".into()),
            log_json: env("FREEMONITOR_LOG_JSON").map(|value| is_truthy(&value)).unwrap_or(false),
            directory_file: env("FREEMONITOR_DIRECTORY_FILE")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            cache_max_size: bounded(
                parsed(&env, "FREEMONITOR_CACHE_MAX_SIZE"),
                DEFAULT_MAX_SIZE,
                MAX_CACHE_SIZE,
            ),
            cache_ttl_secs: seconds(&env, "FREEMONITOR_CACHE_TTL_SECS", DEFAULT_TTL_SECS),
            cache_sweep_secs: bounded(
                parsed(&env, "FREEMONITOR_CACHE_SWEEP_SECS"),
                DEFAULT_SWEEP_SECS,
                MAX_DURATION_SECS,
            ),
            inactivity_secs: seconds(&env, "FREEMONITOR_INACTIVITY_SECS", DEFAULT_INACTIVITY_SECS),
            reaper_interval_secs: bounded(
                parsed(&env, "FREEMONITOR_REAPER_INTERVAL_SECS"),
                DEFAULT_SWEEP_SECS,
                MAX_DURATION_SECS,
            ),
            outbound_buffer: bounded(
                parsed(&env, "FREEMONITOR_OUTBOUND_BUFFER"),
                DEFAULT_OUTBOUND_BUFFER,
                MAX_OUTBOUND_BUFFER,
            ),
            telemetry_per_minute: bounded(
                parsed(&env, "FREEMONITOR_TELEMETRY_PER_MINUTE"),
                DEFAULT_TELEMETRY_PER_MINUTE,
                MAX_EVENTS_PER_MINUTE,
            ),
            control_per_minute: bounded(
                parsed(&env, "FREEMONITOR_CONTROL_PER_MINUTE"),
                DEFAULT_CONTROL_PER_MINUTE,
                MAX_EVENTS_PER_MINUTE,
            ),
        }
    }

    pub fn with_listen_override(mut self, host: Option<&str>, port: Option<u16>) -> Self {
        let host = host.map(str::to_string).unwrap_or_else(|| self.listen_addr.ip().to_string());
        let port = port.unwrap_or(self.listen_addr.port());
        self.listen_addr = listen_addr(&host, port);
        self
    }

    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            cache: AccessCacheConfig {
                max_size: self.cache_max_size,
                ttl: Duration::seconds(self.cache_ttl_secs),
            },
            inactivity_threshold: Duration::seconds(self.inactivity_secs),
            reaper_interval: StdDuration::from_secs(self.reaper_interval_secs),
            cache_sweep_interval: StdDuration::from_secs(self.cache_sweep_secs),
            outbound_buffer: self.outbound_buffer,
            telemetry_per_minute: self.telemetry_per_minute,
            control_per_minute: self.control_per_minute,
        }
    }
}

fn listen_addr(host: &str, port: u16) -> SocketAddr {
    format!("{host}:{port}").parse().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}

fn parsed<T, F>(env: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|value| value.trim().parse().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Zero and anything above `max` count as unset.
fn bounded<T>(value: Option<T>, default: T, max: T) -> T
where
    T: PartialOrd + Default,
{
    value.filter(|value| *value > T::default() && *value <= max).unwrap_or(default)
}

fn seconds<F>(env: &F, key: &str, default: i64) -> i64
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let value = bounded(parsed::<u64, _>(env, key), 0, MAX_DURATION_SECS);
    i64::try_from(value).ok().filter(|secs| *secs > 0).unwrap_or(default)
}
