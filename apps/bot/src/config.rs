use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;

/// How the runtime reaches the protocol implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Accept connections on `host:port` + `ws_path`.
    Server,
    /// Dial `ws_url` and keep the connection up.
    Client,
}

/// Bot runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: TransportMode,
    /// Logical service these connections belong to.
    pub service_id: String,
    /// Address the server binds to (server mode).
    pub host: String,
    /// Port the server binds to (server mode).
    pub port: u16,
    /// Path WebSocket upgrades are accepted on (server mode).
    pub ws_path: String,
    /// Remote endpoint (client mode).
    pub ws_url: Option<String>,
    /// Static bearer token. `None` disables the check.
    pub access_token: Option<String>,
    /// A connection without a heartbeat for this long is closed.
    pub heartbeat_timeout: Duration,
    /// Default per-call timeout for remote actions.
    pub api_timeout: Duration,
    /// First reconnect delay (client mode); doubles up to `reconnect_max_interval`.
    pub reconnect_interval: Duration,
    pub reconnect_max_interval: Duration,
    pub super_users: HashSet<i64>,
    pub blocked_users: HashSet<i64>,
    pub enable_commands: bool,
    pub auto_mark_read: bool,
    /// Log every inbound/outbound frame at debug level.
    pub socket_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TransportMode::Server,
            service_id: "kestrel".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/onebot/v11/ws".to_string(),
            ws_url: None,
            access_token: None,
            heartbeat_timeout: Duration::from_secs(15),
            api_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            reconnect_max_interval: Duration::from_secs(60),
            super_users: HashSet::new(),
            blocked_users: HashSet::new(),
            enable_commands: true,
            auto_mark_read: false,
            socket_log: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables take their defaults; set-but-invalid values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string());

        let mode = match var("BOT_MODE").as_deref() {
            None | Some("") | Some("server") => TransportMode::Server,
            Some("client") => TransportMode::Client,
            Some(other) => {
                return Err(ConfigError::invalid("BOT_MODE", other, "expected server or client"))
            }
        };

        let service_id = match var("BOT_SERVICE_ID") {
            None => defaults.service_id,
            Some(id) if id.is_empty() => return Err(ConfigError::Missing("BOT_SERVICE_ID")),
            Some(id) => id,
        };

        let port = match var("PORT") {
            None => defaults.port,
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) | Err(_) => return Err(ConfigError::invalid("PORT", raw, "expected 1-65535")),
                Ok(port) => port,
            },
        };

        let ws_path = match var("BOT_WS_PATH") {
            None => defaults.ws_path,
            Some(path) if path == "/health" => {
                return Err(ConfigError::invalid("BOT_WS_PATH", path, "collides with the health route"))
            }
            Some(path) if path.starts_with('/') => path,
            Some(path) => return Err(ConfigError::invalid("BOT_WS_PATH", path, "must start with '/'")),
        };

        let ws_url = var("BOT_WS_URL").filter(|s| !s.is_empty());
        if mode == TransportMode::Client && ws_url.is_none() {
            return Err(ConfigError::Missing("BOT_WS_URL"));
        }

        Ok(Self {
            mode,
            service_id,
            host: var("HOST").filter(|s| !s.is_empty()).unwrap_or(defaults.host),
            port,
            ws_path,
            ws_url,
            access_token: var("BOT_ACCESS_TOKEN").filter(|s| !s.is_empty()),
            heartbeat_timeout: secs_var(&var, "BOT_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            api_timeout: secs_var(&var, "BOT_API_TIMEOUT_SECS", defaults.api_timeout)?,
            reconnect_interval: secs_var(&var, "BOT_RECONNECT_INTERVAL_SECS", defaults.reconnect_interval)?,
            reconnect_max_interval: secs_var(
                &var,
                "BOT_RECONNECT_MAX_SECS",
                defaults.reconnect_max_interval,
            )?,
            super_users: id_list_var(&var, "BOT_SUPER_USERS")?,
            blocked_users: id_list_var(&var, "BOT_BLOCKED_USERS")?,
            enable_commands: bool_var(&var, "BOT_ENABLE_COMMANDS", defaults.enable_commands)?,
            auto_mark_read: bool_var(&var, "BOT_AUTO_MARK_READ", defaults.auto_mark_read)?,
            socket_log: bool_var(&var, "BOT_SOCKET_LOG", defaults.socket_log)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn secs_var(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::invalid(name, raw, "expected a positive number of seconds")),
            Ok(secs) => Ok(Duration::from_secs(secs)),
        },
    }
}

fn bool_var(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match var(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("") => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::invalid(name, other, "expected true or false")),
    }
}

fn id_list_var(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<HashSet<i64>, ConfigError> {
    let Some(raw) = var(name) else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| ConfigError::invalid(name, s, "expected comma-separated integer ids"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mode, TransportMode::Server);
        assert_eq!(config.port, 8080);
        assert_eq!(config.ws_path, "/onebot/v11/ws");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.api_timeout, Duration::from_secs(5));
        assert!(config.enable_commands);
        assert!(!config.auto_mark_read);
        assert!(config.access_token.is_none());
    }

    #[test]
    fn parses_full_client_config() {
        let config = Config::from_lookup(lookup(&[
            ("BOT_MODE", "client"),
            ("BOT_WS_URL", "ws://127.0.0.1:6700"),
            ("BOT_ACCESS_TOKEN", "s3cret"),
            ("BOT_HEARTBEAT_TIMEOUT_SECS", "30"),
            ("BOT_SUPER_USERS", "1, 2,3"),
            ("BOT_AUTO_MARK_READ", "yes"),
        ]))
        .unwrap();
        assert_eq!(config.mode, TransportMode::Client);
        assert_eq!(config.ws_url.as_deref(), Some("ws://127.0.0.1:6700"));
        assert_eq!(config.access_token.as_deref(), Some("s3cret"));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.super_users, HashSet::from([1, 2, 3]));
        assert!(config.auto_mark_read);
    }

    #[test]
    fn client_mode_requires_url() {
        let err = Config::from_lookup(lookup(&[("BOT_MODE", "client")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("BOT_WS_URL"));
    }

    #[test]
    fn rejects_bad_port() {
        for bad in ["0", "70000", "http"] {
            let err = Config::from_lookup(lookup(&[("PORT", bad)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }), "{bad}");
        }
    }

    #[test]
    fn rejects_empty_service_id() {
        let err = Config::from_lookup(lookup(&[("BOT_SERVICE_ID", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("BOT_SERVICE_ID"));
    }

    #[test]
    fn rejects_zero_timeout_and_bad_ids() {
        assert!(Config::from_lookup(lookup(&[("BOT_API_TIMEOUT_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BOT_BLOCKED_USERS", "1,x")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BOT_MODE", "relay")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BOT_WS_PATH", "ws")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BOT_WS_PATH", "/health")])).is_err());
    }
}
