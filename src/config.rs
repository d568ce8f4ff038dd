use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::clock::BusinessClock;
use crate::schedule::SchedulingRules;

const PREFIX: &str = "SLOTBOOK_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: String, value: String, reason: String },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{PREFIX}{var}={value:?}: {reason}")
            }
            ConfigError::TlsPair => write!(
                f,
                "both {PREFIX}TLS_CERT and {PREFIX}TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the server reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub admins: HashSet<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub timezone: Tz,
    pub rules: SchedulingRules,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(format!("{PREFIX}{key}")).ok())
    }

    /// Build from a lookup over unprefixed variable names (`PORT`, `TIMEZONE`, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = SchedulingRules::default();

        let tls_cert = lookup("TLS_CERT");
        let tls_key = lookup("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        let admins = lookup("ADMINS")
            .unwrap_or_else(|| "admin".into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let rules = SchedulingRules {
            session_minutes: parsed(&lookup, "SESSION_MINUTES", defaults.session_minutes)?,
            buffer_minutes: parsed(&lookup, "BUFFER_MINUTES", defaults.buffer_minutes)?,
            day_start: time_of_day(&lookup, "DAY_START", defaults.day_start)?,
            day_end: time_of_day(&lookup, "DAY_END", defaults.day_end)?,
        };
        if rules.session_minutes == 0 {
            return Err(invalid("SESSION_MINUTES", "0", "must be positive"));
        }
        if rules.day_start >= rules.day_end {
            return Err(invalid(
                "DAY_END",
                &rules.day_end.format("%H:%M").to_string(),
                "must be after DAY_START",
            ));
        }

        Ok(Self {
            bind: lookup("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "PORT", 5433)?,
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("PASSWORD").unwrap_or_else(|| "slotbook".into()),
            admins,
            max_connections: parsed(&lookup, "MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed(&lookup, "COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("METRICS_PORT")
                .map(|v| v.parse().map_err(|e| invalid("METRICS_PORT", &v, e)))
                .transpose()?,
            tls_cert,
            tls_key,
            timezone: match lookup("TIMEZONE") {
                Some(name) => name
                    .parse()
                    .map_err(|e| invalid("TIMEZONE", &name, e))?,
                None => chrono_tz::Europe::Berlin,
            },
            rules,
        })
    }

    pub fn clock(&self) -> BusinessClock {
        BusinessClock::new(self.timezone)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn invalid(var: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var: var.into(),
        value: value.into(),
        reason: reason.to_string(),
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(v) => v.trim().parse().map_err(|e| invalid(var, &v, e)),
        None => Ok(default),
    }
}

fn time_of_day(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: NaiveTime,
) -> Result<NaiveTime, ConfigError> {
    match lookup(var) {
        Some(v) => NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|e| invalid(var, &v, e)),
        None => Ok(default),
    }
}
