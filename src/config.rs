use std::{collections::HashSet, time::Duration};

use thiserror::Error;
use tracing::warn;
use url::Url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_QUOTA_SWEEP_SECONDS: u64 = 60 * 60;
const DEFAULT_DEV_ORIGINS: [&str; 3] = [
    "http://127.0.0.1:5173",
    "http://localhost:5173",
    "http://localhost:3000",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid origin in ALLOWED_ORIGINS: {0}. Expected values like https://example.com")]
    InvalidOrigin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: HashSet<String>,
    pub trust_proxy_headers: bool,
    pub jwt_secret: Option<String>,
    pub environment: Environment,
    pub yt_dlp_bin: String,
    pub quota_sweep_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            allowed_origins: DEFAULT_DEV_ORIGINS
                .iter()
                .filter_map(|origin| normalize_origin(origin))
                .collect(),
            trust_proxy_headers: false,
            jwt_secret: None,
            environment: Environment::Development,
            yt_dlp_bin: DEFAULT_YT_DLP_BIN.to_string(),
            quota_sweep_interval: Duration::from_secs(DEFAULT_QUOTA_SWEEP_SECONDS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let allowed_origins = match read_list_env("ALLOWED_ORIGINS") {
            Some(origins) => parse_origins(&origins)?,
            None => {
                warn!("ALLOWED_ORIGINS is not set. Falling back to local development origins.");
                defaults.allowed_origins
            }
        };

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins,
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            jwt_secret: std::env::var("JWT_SECRET")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string)),
            environment: std::env::var("APP_ENV")
                .map(|value| Environment::parse(&value))
                .unwrap_or(Environment::Development),
            yt_dlp_bin: std::env::var("YT_DLP_BIN")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or(defaults.yt_dlp_bin),
            quota_sweep_interval: read_usize_env("QUOTA_SWEEP_SECONDS")
                .filter(|value| *value > 0)
                .map(|value| Duration::from_secs(value as u64))
                .unwrap_or(defaults.quota_sweep_interval),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_bool(&value)
}

pub fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_list_env(name: &str) -> Option<Vec<String>> {
    let values = std::env::var(name)
        .ok()?
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    if values.is_empty() { None } else { Some(values) }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Reduces an origin to `scheme://host[:port]`, dropping default ports.
/// Anything carrying a path, query, or fragment is rejected.
fn parse_origins(origins: &[String]) -> Result<HashSet<String>, ConfigError> {
    origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| ConfigError::InvalidOrigin(origin.clone()))
        })
        .collect()
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match port.filter(|explicit| *explicit != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
