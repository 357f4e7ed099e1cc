// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Session timings are code constants (see
// `realtime::session`); only the queue capacity is tunable here.

use std::{env::VarError, net::SocketAddr};

use crate::{
    db::pool::PoolConfig,
    realtime::session::{SessionConfig, DEFAULT_OUTBOUND_QUEUE_CAPACITY},
};

const DEV_JWT_SECRET: &str = "beacon_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to validate (and, for tooling, issue) access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` keeps notifications in memory.
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `beacon_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub session: SessionConfig,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BEACON_RELAY_HOST` | `0.0.0.0` |
    /// | `BEACON_RELAY_PORT` | `8080` |
    /// | `BEACON_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `BEACON_RELAY_DATABASE_URL` | *(none, in-memory store)* |
    /// | `BEACON_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `BEACON_RELAY_LOG_FILTER` | `info` |
    /// | `BEACON_RELAY_LOG_FORMAT` | `pretty` |
    /// | `BEACON_RELAY_OUTBOUND_QUEUE_CAPACITY` | `10` |
    /// | `BEACON_RELAY_DB_*` | see [`PoolConfig::from_env_fn`] |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let host = env("BEACON_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("BEACON_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("BEACON_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url =
            env("BEACON_RELAY_DATABASE_URL").ok().filter(|value| !value.trim().is_empty());
        let cors_origins = env("BEACON_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("BEACON_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("BEACON_RELAY_LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let outbound_queue_capacity = env("BEACON_RELAY_OUTBOUND_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            pool: PoolConfig::from_env_fn(&env),
            cors_origins,
            log_filter,
            log_format,
            session: SessionConfig::default().with_outbound_queue_capacity(outbound_queue_capacity),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
