use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::workflows::repairs::TicketStatus;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub repairs: RepairConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                with_target: false,
                ansi: environment == AppEnvironment::Development,
            },
            repairs: RepairConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub with_target: bool,
    pub ansi: bool,
}

/// Knobs for the damage report workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairConfig {
    /// Target statuses that refuse a transition without a comment.
    pub comment_required: Vec<TicketStatus>,
    /// Upper bound for a single notification transport call.
    pub transport_timeout: Duration,
    /// How often a lifecycle operation is re-run after a stale ticket version.
    pub max_conflict_retries: u32,
    /// Lets companies bid without an open offer request.
    pub allow_direct_offers: bool,
    /// Highest accepted company rating.
    pub rating_scale: u8,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            comment_required: vec![TicketStatus::Rejected, TicketStatus::Cancelled],
            transport_timeout: Duration::from_millis(5_000),
            max_conflict_retries: 3,
            allow_direct_offers: false,
            rating_scale: 5,
        }
    }
}

impl RepairConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let comment_required = match env::var("REPAIRS_COMMENT_REQUIRED") {
            Ok(raw) => parse_status_list(&raw)?,
            Err(_) => defaults.comment_required,
        };

        let transport_timeout = match env::var("REPAIRS_TRANSPORT_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(parse_number("REPAIRS_TRANSPORT_TIMEOUT_MS", &raw)?),
            Err(_) => defaults.transport_timeout,
        };

        let max_conflict_retries = match env::var("REPAIRS_CONFLICT_RETRIES") {
            Ok(raw) => parse_number("REPAIRS_CONFLICT_RETRIES", &raw)?,
            Err(_) => defaults.max_conflict_retries,
        };

        let allow_direct_offers = match env::var("REPAIRS_ALLOW_DIRECT_OFFERS") {
            Ok(raw) => parse_flag("REPAIRS_ALLOW_DIRECT_OFFERS", &raw)?,
            Err(_) => defaults.allow_direct_offers,
        };

        let rating_scale = match env::var("REPAIRS_RATING_SCALE") {
            Ok(raw) => {
                let scale: u8 = parse_number("REPAIRS_RATING_SCALE", &raw)?;
                if scale == 0 {
                    return Err(ConfigError::InvalidNumber {
                        variable: "REPAIRS_RATING_SCALE",
                        value: raw,
                    });
                }
                scale
            }
            Err(_) => defaults.rating_scale,
        };

        Ok(Self {
            comment_required,
            transport_timeout,
            max_conflict_retries,
            allow_direct_offers,
            rating_scale,
        })
    }
}

fn parse_status_list(raw: &str) -> Result<Vec<TicketStatus>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| {
            TicketStatus::from_key(key).ok_or_else(|| ConfigError::UnknownStatus(key.to_string()))
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(variable: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidNumber {
            variable,
            value: raw.to_string(),
        })
}

fn parse_flag(variable: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            variable,
            value: raw.to_string(),
        }),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    UnknownStatus(String),
    InvalidNumber { variable: &'static str, value: String },
    InvalidFlag { variable: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::UnknownStatus(key) => {
                write!(f, "REPAIRS_COMMENT_REQUIRED names unknown status '{key}'")
            }
            ConfigError::InvalidNumber { variable, value } => {
                write!(f, "{variable} must be a positive number, got '{value}'")
            }
            ConfigError::InvalidFlag { variable, value } => {
                write!(f, "{variable} must be true or false, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::UnknownStatus(_)
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidFlag { .. } => None,
        }
    }
}
