use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;

use crate::catalog::{self, Day};
use crate::limits::*;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Static rules of the event. Supplied once at startup, never computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    pub days: [NaiveDate; 2],
    pub stations: Vec<String>,
    pub max_reservations_per_slot: u32,
    pub max_reservations_per_student: u32,
    /// Cancels any reservation when presented. `None` disables the override.
    pub master_code: Option<String>,
    pub require_name: bool,
    pub strict_student_id: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            days: [
                NaiveDate::from_ymd_opt(2025, 11, 11).unwrap_or_default(),
                NaiveDate::from_ymd_opt(2025, 11, 12).unwrap_or_default(),
            ],
            stations: catalog::stations(),
            max_reservations_per_slot: 2,
            max_reservations_per_student: 2,
            master_code: None,
            require_name: true,
            strict_student_id: true,
        }
    }
}

impl EventConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let day_one = env_date("LABSLOT_DAY_ONE")?.unwrap_or(defaults.days[0]);
        let day_two = env_date("LABSLOT_DAY_TWO")?.unwrap_or(defaults.days[1]);
        let stations = match std::env::var("LABSLOT_STATIONS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.stations,
        };
        let config = Self {
            days: [day_one, day_two],
            stations,
            max_reservations_per_slot: env_parse("LABSLOT_MAX_PER_SLOT")?
                .unwrap_or(defaults.max_reservations_per_slot),
            max_reservations_per_student: env_parse("LABSLOT_MAX_PER_STUDENT")?
                .unwrap_or(defaults.max_reservations_per_student),
            master_code: std::env::var("LABSLOT_MASTER_CODE")
                .ok()
                .filter(|c| !c.is_empty()),
            require_name: env_parse("LABSLOT_REQUIRE_NAME")?.unwrap_or(defaults.require_name),
            strict_student_id: env_parse("LABSLOT_STRICT_STUDENT_ID")?
                .unwrap_or(defaults.strict_student_id),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.days[0] == self.days[1] {
            return Err(ConfigError::Invalid("event days must differ".into()));
        }
        if self.stations.is_empty() {
            return Err(ConfigError::Invalid("no stations configured".into()));
        }
        if self.stations.len() > MAX_STATIONS {
            return Err(ConfigError::Invalid(format!(
                "at most {MAX_STATIONS} stations supported"
            )));
        }
        if let Some(s) = self.stations.iter().find(|s| s.len() > MAX_STATION_LEN) {
            return Err(ConfigError::Invalid(format!("station name too long: {s}")));
        }
        for (i, s) in self.stations.iter().enumerate() {
            if self.stations[..i].contains(s) {
                return Err(ConfigError::Invalid(format!("duplicate station: {s}")));
            }
        }
        if self.max_reservations_per_slot == 0 {
            return Err(ConfigError::Invalid("per-slot capacity must be at least 1".into()));
        }
        if self.max_reservations_per_student == 0 {
            return Err(ConfigError::Invalid("per-student quota must be at least 1".into()));
        }
        Ok(())
    }

    pub fn date_of(&self, day: Day) -> NaiveDate {
        self.days[day.index()]
    }

    pub fn day_of(&self, date: NaiveDate) -> Option<Day> {
        Day::ALL.into_iter().find(|d| self.date_of(*d) == date)
    }

    pub fn has_station(&self, lab_id: &str) -> bool {
        self.stations.iter().any(|s| s == lab_id)
    }

    pub fn is_master_code(&self, code: &str) -> bool {
        self.master_code.as_deref() == Some(code)
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub op_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind: std::env::var("LABSLOT_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("LABSLOT_PORT")?.unwrap_or(5433),
            data_dir: std::env::var("LABSLOT_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            password: std::env::var("LABSLOT_PASSWORD").unwrap_or_else(|_| "labslot".into()),
            max_connections: env_parse("LABSLOT_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: env_parse("LABSLOT_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: env_parse("LABSLOT_METRICS_PORT")?,
            tls_cert: std::env::var("LABSLOT_TLS_CERT").ok(),
            tls_key: std::env::var("LABSLOT_TLS_KEY").ok(),
            op_timeout: Duration::from_millis(
                env_parse("LABSLOT_OP_TIMEOUT_MS")?.unwrap_or(10_000),
            ),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::BadValue { key, reason: e.to_string() }),
        Err(_) => Ok(None),
    }
}

fn env_date(key: &'static str) -> Result<Option<NaiveDate>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_date(raw.trim())
            .map(Some)
            .map_err(|reason| ConfigError::BadValue { key, reason }),
        Err(_) => Ok(None),
    }
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|e| format!("bad date {raw:?}: {e}"))
}

#[derive(Debug)]
pub enum ConfigError {
    BadValue { key: &'static str, reason: String },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BadValue { key, reason } => write!(f, "invalid {key}: {reason}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
