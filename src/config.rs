use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::calendar::BusinessCalendar;
use crate::feed::FeedPolicy;
use crate::slots::{DEFAULT_GRID_MINUTES, DEFAULT_LEAD_TIME_MINUTES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} and {other} must be set together")]
    Incomplete { var: &'static str, other: &'static str },
    #[error("{path}: {reason}")]
    Tls { path: String, reason: String },
}

/// Scheduling knobs shared by every tenant engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingSettings {
    pub calendar: BusinessCalendar,
    pub grid_minutes: u32,
    pub lead_time_minutes: u32,
    pub feed_policy: FeedPolicy,
    pub feed_timeout_ms: u64,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            calendar: BusinessCalendar::default(),
            grid_minutes: DEFAULT_GRID_MINUTES,
            lead_time_minutes: DEFAULT_LEAD_TIME_MINUTES,
            feed_policy: FeedPolicy::default(),
            feed_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub scheduling: SchedulingSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tz: Tz = parse_or(&get, "SLOTBOOK_TIMEZONE", Tz::UTC)?;
        let grid_minutes: u32 = parse_or(&get, "SLOTBOOK_GRID_MINUTES", DEFAULT_GRID_MINUTES)?;
        if grid_minutes == 0 || 1440 % grid_minutes != 0 {
            return Err(ConfigError::Invalid {
                var: "SLOTBOOK_GRID_MINUTES",
                value: grid_minutes.to_string(),
                reason: "must divide a day evenly".into(),
            });
        }

        let scheduling = SchedulingSettings {
            calendar: BusinessCalendar::new(tz),
            grid_minutes,
            lead_time_minutes: parse_or(&get, "SLOTBOOK_LEAD_TIME_MINUTES", DEFAULT_LEAD_TIME_MINUTES)?,
            feed_policy: parse_or(&get, "SLOTBOOK_FEED_POLICY", FeedPolicy::default())?,
            feed_timeout_ms: parse_or(&get, "SLOTBOOK_FEED_TIMEOUT_MS", 2000)?,
        };

        let password = get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into());
        if password.is_empty() {
            return Err(ConfigError::Invalid {
                var: "SLOTBOOK_PASSWORD",
                value: password,
                reason: "must not be empty".into(),
            });
        }

        Ok(Self {
            port: parse_or(&get, "SLOTBOOK_PORT", 5433)?,
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password,
            max_connections: parse_or(&get, "SLOTBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            metrics_port: match get("SLOTBOOK_METRICS_PORT") {
                Some(raw) => Some(parse(&raw, "SLOTBOOK_METRICS_PORT")?),
                None => None,
            },
            scheduling,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => parse(&raw, var),
        None => Ok(default),
    }
}

fn parse<T>(raw: &str, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
