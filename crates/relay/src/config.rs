// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning variables (see
// `db::pool::PoolConfig`).

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::session::SessionConfig;

const DEV_JWT_SECRET: &str = "onezone_local_development_jwt_secret_must_be_32_chars";

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
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
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `onezone_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Identity of this relay process in the page ownership lease table.
    pub node_id: Uuid,
    pub lock_ttl: Duration,
    pub presence_timeout: Duration,
    pub flush_debounce: Duration,
    pub idle_grace: Duration,
    pub sweep_interval: Duration,
    pub release_lock_on_disconnect: bool,
    pub ownership_ttl: Duration,
    pub mutate_rate_per_minute: usize,
    pub search_rate_per_minute: usize,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ONEZONE_RELAY_HOST` | `0.0.0.0` |
    /// | `ONEZONE_RELAY_PORT` | `8080` |
    /// | `ONEZONE_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `ONEZONE_RELAY_DATABASE_URL` | *(none: in-memory store)* |
    /// | `ONEZONE_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `ONEZONE_RELAY_LOG_FILTER` | `info` |
    /// | `ONEZONE_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `ONEZONE_RELAY_NODE_ID` | random per process |
    /// | `ONEZONE_RELAY_LOCK_TTL_SECS` | `30` (5..=600) |
    /// | `ONEZONE_RELAY_PRESENCE_TIMEOUT_SECS` | `90` (10..=3600) |
    /// | `ONEZONE_RELAY_FLUSH_DEBOUNCE_MS` | `2000` (500..=10000) |
    /// | `ONEZONE_RELAY_IDLE_GRACE_SECS` | `30` |
    /// | `ONEZONE_RELAY_SWEEP_INTERVAL_SECS` | `10` |
    /// | `ONEZONE_RELAY_RELEASE_LOCK_ON_DISCONNECT` | `false` |
    /// | `ONEZONE_RELAY_OWNERSHIP_TTL_SECS` | `60` |
    /// | `ONEZONE_RELAY_MUTATE_RATE_PER_MINUTE` | `120` |
    /// | `ONEZONE_RELAY_SEARCH_RATE_PER_MINUTE` | `20` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parse_u64 = |key: &str, default: u64| -> u64 {
            env(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let host = env("ONEZONE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ONEZONE_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("ONEZONE_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("ONEZONE_RELAY_DATABASE_URL").ok().filter(|v| !v.is_empty());
        let cors_origins = env("ONEZONE_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("ONEZONE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("ONEZONE_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let node_id = env("ONEZONE_RELAY_NODE_ID")
            .ok()
            .and_then(|v| Uuid::parse_str(&v).ok())
            .unwrap_or_else(Uuid::new_v4);

        let release_lock_on_disconnect = env("ONEZONE_RELAY_RELEASE_LOCK_ON_DISCONNECT")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            node_id,
            lock_ttl: Duration::from_secs(
                parse_u64("ONEZONE_RELAY_LOCK_TTL_SECS", 30).clamp(5, 600),
            ),
            presence_timeout: Duration::from_secs(
                parse_u64("ONEZONE_RELAY_PRESENCE_TIMEOUT_SECS", 90).clamp(10, 3600),
            ),
            flush_debounce: Duration::from_millis(
                parse_u64("ONEZONE_RELAY_FLUSH_DEBOUNCE_MS", 2000).clamp(500, 10_000),
            ),
            idle_grace: Duration::from_secs(parse_u64("ONEZONE_RELAY_IDLE_GRACE_SECS", 30)),
            sweep_interval: Duration::from_secs(
                parse_u64("ONEZONE_RELAY_SWEEP_INTERVAL_SECS", 10).max(1),
            ),
            release_lock_on_disconnect,
            ownership_ttl: Duration::from_secs(
                parse_u64("ONEZONE_RELAY_OWNERSHIP_TTL_SECS", 60).max(5),
            ),
            mutate_rate_per_minute: parse_u64("ONEZONE_RELAY_MUTATE_RATE_PER_MINUTE", 120) as usize,
            search_rate_per_minute: parse_u64("ONEZONE_RELAY_SEARCH_RATE_PER_MINUTE", 20) as usize,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lock_ttl: self.lock_ttl,
            presence_timeout: self.presence_timeout,
            flush_debounce: self.flush_debounce,
            idle_grace: self.idle_grace,
            sweep_interval: self.sweep_interval,
            release_lock_on_disconnect: self.release_lock_on_disconnect,
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert_eq!(cfg.presence_timeout, Duration::from_secs(90));
        assert_eq!(cfg.flush_debounce, Duration::from_millis(2000));
        assert_eq!(cfg.idle_grace, Duration::from_secs(30));
        assert!(!cfg.release_lock_on_disconnect);
        assert_eq!(cfg.mutate_rate_per_minute, 120);
        assert_eq!(cfg.search_rate_per_minute, 20);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_HOST", "127.0.0.1");
        m.insert("ONEZONE_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn empty_database_url_means_memory_store() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_DATABASE_URL", "");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn timings_are_clamped() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_LOCK_TTL_SECS", "1");
        m.insert("ONEZONE_RELAY_PRESENCE_TIMEOUT_SECS", "999999");
        m.insert("ONEZONE_RELAY_FLUSH_DEBOUNCE_MS", "10");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(5));
        assert_eq!(cfg.presence_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.flush_debounce, Duration::from_millis(500));
    }

    #[test]
    fn release_on_disconnect_and_json_logs() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_RELEASE_LOCK_ON_DISCONNECT", "TRUE");
        m.insert("ONEZONE_RELAY_LOG_FORMAT", "json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.release_lock_on_disconnect);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.session_config().release_lock_on_disconnect);
    }

    #[test]
    fn node_id_from_env() {
        let mut m = HashMap::new();
        m.insert("ONEZONE_RELAY_NODE_ID", "6f1c1c9e-5c7f-4e43-9a7a-3f4f2d0d7b11");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.node_id.to_string(), "6f1c1c9e-5c7f-4e43-9a7a-3f4f2d0d7b11");
    }
}
