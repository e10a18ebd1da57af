//! Configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub manager: ManagerConfig,
    pub router: RouterConfig,
    pub bridge: BridgeConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database: DatabaseConfig::from_env()?,
            manager: ManagerConfig::from_env()?,
            router: RouterConfig::from_env()?,
            bridge: BridgeConfig::from_env()?,
            http: HttpConfig::from_env()?,
        })
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = optional_env("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/wapanel".to_string());
        Ok(Self {
            url: SecretString::from(url),
            pool_size: parse_env("DATABASE_POOL_SIZE", 10)?,
        })
    }

    pub fn url(&self) -> &str {
        use secrecy::ExposeSecret;
        self.url.expose_secret()
    }
}

/// Settings for the instance lifecycle controller and reconnection scheduler.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum instance starts per rate window, across all agents.
    pub max_starts_per_window: u32,
    /// Length of the global rate window.
    pub rate_window: Duration,
    /// Delay of the first reconnection attempt.
    pub backoff_base: Duration,
    /// Upper bound on any reconnection delay.
    pub backoff_max: Duration,
    /// Fraction of the backoff delay added as random jitter (0 disables).
    pub backoff_jitter_ratio: f64,
    pub max_reconnect_attempts: u32,
    pub max_qr_regenerations: u32,
    /// How long a new client may go without connecting before it is closed.
    pub connect_timeout: Duration,
    /// Delay before a logged-out instance is restarted to show a new QR.
    pub logout_restart_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_starts_per_window: 10,
            rate_window: Duration::from_secs(60),
            backoff_base: Duration::from_millis(3_000),
            backoff_max: Duration::from_millis(60_000),
            backoff_jitter_ratio: 0.2,
            max_reconnect_attempts: 3,
            max_qr_regenerations: 10,
            connect_timeout: Duration::from_secs(300),
            logout_restart_delay: Duration::from_secs(2),
        }
    }
}

impl ManagerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let jitter: f64 = parse_env("WAPANEL_BACKOFF_JITTER", d.backoff_jitter_ratio)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidValue {
                key: "WAPANEL_BACKOFF_JITTER".to_string(),
                message: format!("must be between 0 and 1, got {}", jitter),
            });
        }

        Ok(Self {
            max_starts_per_window: parse_env("WAPANEL_MAX_STARTS_PER_WINDOW", d.max_starts_per_window)?,
            rate_window: Duration::from_secs(parse_env(
                "WAPANEL_RATE_WINDOW_SECS",
                d.rate_window.as_secs(),
            )?),
            backoff_base: Duration::from_millis(parse_env(
                "WAPANEL_BACKOFF_BASE_MS",
                d.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parse_env(
                "WAPANEL_BACKOFF_MAX_MS",
                d.backoff_max.as_millis() as u64,
            )?),
            backoff_jitter_ratio: jitter,
            max_reconnect_attempts: parse_env("WAPANEL_MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts)?,
            max_qr_regenerations: parse_env("WAPANEL_MAX_QR_REGENERATIONS", d.max_qr_regenerations)?,
            connect_timeout: Duration::from_secs(parse_env(
                "WAPANEL_CONNECT_TIMEOUT_SECS",
                d.connect_timeout.as_secs(),
            )?),
            logout_restart_delay: Duration::from_millis(parse_env(
                "WAPANEL_LOGOUT_RESTART_MS",
                d.logout_restart_delay.as_millis() as u64,
            )?),
        })
    }

    /// Disable jitter so reconnection delays are exact.
    pub fn without_jitter(mut self) -> Self {
        self.backoff_jitter_ratio = 0.0;
        self
    }
}

/// Inbound message routing settings.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Whether group chats are routed. Broadcast and status messages never are.
    pub allow_groups: bool,
}

impl RouterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            allow_groups: parse_bool_env("WAPANEL_ALLOW_GROUPS", false)?,
        })
    }
}

/// Settings for the browser-automation bridge that hosts session clients.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub base_url: String,
    /// Directory holding per-session credential folders.
    pub auth_dir: PathBuf,
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3100".to_string(),
            auth_dir: default_auth_dir(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            base_url: optional_env("WAPANEL_BRIDGE_URL").unwrap_or(d.base_url),
            auth_dir: optional_env("WAPANEL_AUTH_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.auth_dir),
            request_timeout: Duration::from_secs(parse_env(
                "WAPANEL_BRIDGE_TIMEOUT_SECS",
                d.request_timeout.as_secs(),
            )?),
        })
    }
}

fn default_auth_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wapanel")
        .join("auth")
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl HttpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: optional_env("WAPANEL_HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env("WAPANEL_HTTP_PORT", 8080)?,
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", raw),
        }),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
