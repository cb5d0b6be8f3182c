//! Scheduling configuration.
//!
//! Settings come from an external configuration service behind
//! [`ConfigSource`]. The engine takes one [`ConfigSnapshot`] per request and
//! resolves it into a [`SchedulerConfig`], filling absent settings with the
//! documented defaults. Nothing here is cached across requests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::conflict::BufferPolicy;
use crate::engine::tiers::{RateTable, RateTier};
use crate::engine::timezone::parse_tz;
use crate::limits::{MAX_SETTING_HOURS, SYMMETRIC_BUFFER_MS};
use crate::model::{HOUR_MS, Ms};

pub const BUFFER_BEFORE_HOURS: &str = "buffer_before_hours";
pub const BUFFER_AFTER_HOURS: &str = "buffer_after_hours";
pub const DEFAULT_DURATION_HOURS: &str = "default_duration_hours";
pub const MINIMUM_ADVANCE_HOURS: &str = "minimum_advance_hours";
pub const BUFFER_POLICY: &str = "buffer_policy";

pub const DEFAULT_BUFFER_BEFORE_HOURS: f64 = 2.0;
pub const DEFAULT_BUFFER_AFTER_HOURS: f64 = 1.0;
pub const DEFAULT_SLOT_DURATION_HOURS: f64 = 2.0;
pub const DEFAULT_MINIMUM_ADVANCE_HOURS: f64 = 1.0;

#[derive(Debug)]
pub enum ConfigError {
    Unavailable(String),
    Parse(String),
    InvalidSetting { key: String, value: String },
    InvalidRateTier(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Unavailable(s) => write!(f, "configuration source unavailable: {s}"),
            ConfigError::Parse(s) => write!(f, "configuration parse error: {s}"),
            ConfigError::InvalidSetting { key, value } => {
                write!(f, "invalid value for {key}: {value}")
            }
            ConfigError::InvalidRateTier(s) => write!(f, "invalid rate tier: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Raw key/value view returned by the configuration service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default)]
    pub rate_tiers: Vec<RateTier>,
}

impl ConfigSnapshot {
    pub fn with_timezone(tz: &str) -> Self {
        Self {
            timezone: Some(tz.to_string()),
            ..Self::default()
        }
    }

    fn hours(&self, key: &str, default: f64) -> Result<Ms, ConfigError> {
        let invalid = |v: &Value| ConfigError::InvalidSetting {
            key: key.to_string(),
            value: v.to_string(),
        };
        let hours = match self.settings.get(key) {
            None | Some(Value::Null) => default,
            Some(v @ Value::Number(n)) => n.as_f64().ok_or_else(|| invalid(v))?,
            Some(v @ Value::String(s)) => s.trim().parse::<f64>().map_err(|_| invalid(v))?,
            Some(v) => return Err(invalid(v)),
        };
        if !hours.is_finite() || !(0.0..=MAX_SETTING_HOURS).contains(&hours) {
            return Err(ConfigError::InvalidSetting {
                key: key.to_string(),
                value: hours.to_string(),
            });
        }
        Ok((hours * HOUR_MS as f64).round() as Ms)
    }

    fn text(&self, key: &str) -> Option<String> {
        match self.settings.get(key) {
            Some(Value::String(s)) => Some(s.trim().to_ascii_lowercase()),
            _ => None,
        }
    }
}

/// External configuration service.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> Result<ConfigSnapshot, ConfigError>;
}

/// In-memory source, mutated by administrative calls.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    inner: RwLock<ConfigSnapshot>,
}

impl StaticConfigSource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// `FIELDBOOK_TIMEZONE` plus optional `FIELDBOOK_<SETTING>` overrides.
    pub fn from_env() -> Self {
        let mut snapshot = ConfigSnapshot {
            timezone: std::env::var("FIELDBOOK_TIMEZONE").ok(),
            ..ConfigSnapshot::default()
        };
        for key in [
            BUFFER_BEFORE_HOURS,
            BUFFER_AFTER_HOURS,
            DEFAULT_DURATION_HOURS,
            MINIMUM_ADVANCE_HOURS,
            BUFFER_POLICY,
        ] {
            let var = format!("FIELDBOOK_{}", key.to_ascii_uppercase());
            if let Ok(v) = std::env::var(var) {
                snapshot.settings.insert(key.to_string(), Value::String(v));
            }
        }
        Self::new(snapshot)
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.settings.insert(key.to_string(), value);
    }

    pub fn set_timezone(&self, tz: Option<&str>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.timezone = tz.map(str::to_string);
    }

    pub fn set_rate_tiers(&self, tiers: Vec<RateTier>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.rate_tiers = tiers;
    }
}

impl ConfigSource for StaticConfigSource {
    fn snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        Ok(self.inner.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// JSON file, re-read on every snapshot so edits apply to the next request.
#[derive(Debug)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigSource for FileConfigSource {
    fn snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Resolved settings threaded through the evaluator and slot search.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timezone: Tz,
    pub buffer_policy: BufferPolicy,
    pub default_duration_ms: Ms,
    pub minimum_advance_ms: Ms,
    pub rate_table: RateTable,
}

impl SchedulerConfig {
    /// A missing timezone is an error: assuming UTC would silently shift
    /// every business day.
    pub fn resolve(snapshot: &ConfigSnapshot) -> Result<Self, ConfigError> {
        let tz_name = snapshot
            .timezone
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::Unavailable("no timezone configured".into()))?;
        let timezone = parse_tz(tz_name).ok_or_else(|| ConfigError::InvalidSetting {
            key: "timezone".into(),
            value: tz_name.to_string(),
        })?;

        let buffer_policy = match snapshot.text(BUFFER_POLICY).as_deref() {
            None | Some("asymmetric_self_exempt") => BufferPolicy::AsymmetricSelfExempt {
                before: snapshot.hours(BUFFER_BEFORE_HOURS, DEFAULT_BUFFER_BEFORE_HOURS)?,
                after: snapshot.hours(BUFFER_AFTER_HOURS, DEFAULT_BUFFER_AFTER_HOURS)?,
            },
            Some("symmetric_universal") => BufferPolicy::SymmetricUniversal {
                buffer: SYMMETRIC_BUFFER_MS,
            },
            Some(other) => {
                return Err(ConfigError::InvalidSetting {
                    key: BUFFER_POLICY.into(),
                    value: other.to_string(),
                });
            }
        };

        let rate_table =
            RateTable::new(snapshot.rate_tiers.clone()).map_err(ConfigError::InvalidRateTier)?;

        Ok(Self {
            timezone,
            buffer_policy,
            default_duration_ms: snapshot.hours(DEFAULT_DURATION_HOURS, DEFAULT_SLOT_DURATION_HOURS)?,
            minimum_advance_ms: snapshot.hours(MINIMUM_ADVANCE_HOURS, DEFAULT_MINIMUM_ADVANCE_HOURS)?,
            rate_table,
        })
    }
}
