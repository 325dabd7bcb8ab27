//! Environment-driven agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use capwatch_scheduler::{DEFAULT_BLACKOUT_MINUTE, ScheduleWindow, SchedulerError};
use capwatch_session::DEFAULT_SESSION_PORT;
use thiserror::Error;

/// Default API base URL for local development.
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000/";

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Env var toggling capture at runtime.
pub const CAPTURE_ENABLED_VAR: &str = "CAPWATCH_CAPTURE_ENABLED";

/// How the one-time capture permission is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentSetting {
    /// Answer fixed by configuration.
    Preset(bool),
    /// Ask interactively on the terminal.
    Prompt,
}

/// Which capture backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OS screen capture.
    Real,
    /// Deterministic synthetic images.
    Synthetic,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Human,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
    /// Directory for the per-run log file; stderr only when unset.
    pub directory: Option<PathBuf>,
}

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Remote API base URL.
    pub api_base_url: String,
    /// Loopback port of the session channel.
    pub session_port: u16,
    /// Tick and blackout policy.
    pub window: ScheduleWindow,
    /// Whether positive decisions start a capture.
    pub capture_on_eligible: bool,
    /// Runtime kill switch.
    pub capture_enabled: bool,
    /// Permission source.
    pub consent: ConsentSetting,
    /// Capture backend.
    pub backend: BackendKind,
    /// Directory for transient artifacts.
    pub capture_dir: PathBuf,
    /// HTTP timeout.
    pub request_timeout: Duration,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for values that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for values that do not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let tick_secs: u64 = parse_or(&get, "CAPWATCH_TICK_SECONDS", 60)?;
        let blackout_minute = match get("CAPWATCH_BLACKOUT_MINUTE") {
            None => Some(DEFAULT_BLACKOUT_MINUTE),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "none" | "off" => None,
                _ => Some(parse_value("CAPWATCH_BLACKOUT_MINUTE", &raw)?),
            },
        };
        let window = ScheduleWindow::new(Duration::from_secs(tick_secs), blackout_minute)
            .map_err(|error| {
                let key = match &error {
                    SchedulerError::InvalidTickPeriod => "CAPWATCH_TICK_SECONDS",
                    _ => "CAPWATCH_BLACKOUT_MINUTE",
                };
                ConfigError::invalid(key, error.to_string())
            })?;

        let consent = match get("CAPWATCH_CAPTURE_CONSENT") {
            None => ConsentSetting::Prompt,
            Some(raw) => ConsentSetting::Preset(parse_switch("CAPWATCH_CAPTURE_CONSENT", &raw)?),
        };

        let backend = match get("CAPWATCH_CAPTURE_BACKEND").as_deref() {
            None | Some("real") => BackendKind::Real,
            Some("synthetic") => BackendKind::Synthetic,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "CAPWATCH_CAPTURE_BACKEND",
                    format!("unknown backend {other:?}"),
                ));
            }
        };

        let format = match get("CAPWATCH_LOG_FORMAT").as_deref() {
            None | Some("human") => LogFormat::Human,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "CAPWATCH_LOG_FORMAT",
                    format!("unknown format {other:?}"),
                ));
            }
        };

        Ok(Self {
            api_base_url: get("CAPWATCH_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            session_port: parse_or(&get, "CAPWATCH_SESSION_PORT", DEFAULT_SESSION_PORT)?,
            window,
            capture_on_eligible: match get("CAPWATCH_CAPTURE_ON_ELIGIBLE") {
                None => false,
                Some(raw) => parse_switch("CAPWATCH_CAPTURE_ON_ELIGIBLE", &raw)?,
            },
            capture_enabled: capture_enabled(get(CAPTURE_ENABLED_VAR).as_deref()),
            consent,
            backend,
            capture_dir: get("CAPWATCH_CAPTURE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("capwatch")),
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "CAPWATCH_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT.as_secs(),
            )?),
            logging: LoggingConfig {
                filter: get("CAPWATCH_LOG").unwrap_or_else(|| "info".to_string()),
                format,
                directory: get("CAPWATCH_LOG_DIR").map(PathBuf::from),
            },
        })
    }
}

/// Checks the runtime kill-switch env var.
///
/// Semantics:
/// - Unset => capture enabled.
/// - `0`, `false`, `off`, `no` (case-insensitive) => capture disabled.
/// - Any other value => capture enabled.
pub fn capture_enabled_from_env() -> bool {
    capture_enabled(std::env::var(CAPTURE_ENABLED_VAR).ok().as_deref())
}

fn capture_enabled(raw: Option<&str>) -> bool {
    match raw {
        Some(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            !matches!(normalized.as_str(), "0" | "false" | "off" | "no")
        }
        None => true,
    }
}

fn parse_switch(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected yes/no, got {other:?}"))),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|error: T::Err| ConfigError::invalid(key, format!("{raw:?}: {error}")))
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// Configuration error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable held an unusable value.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
