use std::path::PathBuf;

use crate::model::{format_time, parse_time, Secs, TimeRange};

/// Engine-level settings: the operating window free-slot queries are cut to,
/// and the smallest free slot worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub window: TimeRange,
    pub granularity: Secs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: TimeRange::new(8 * 3600, 17 * 3600),
            granularity: 30 * 60,
        }
    }
}

/// Process configuration, read from `TIMETABLED_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub directory_file: Option<PathBuf>,
    pub engine: EngineConfig,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take defaults; set but
    /// unparseable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let day_start = time_var(&lookup, "TIMETABLED_DAY_START", defaults.window.start)?;
        let day_end = time_var(&lookup, "TIMETABLED_DAY_END", defaults.window.end)?;
        let window = TimeRange::try_new(day_start, day_end).ok_or_else(|| ConfigError {
            var: "TIMETABLED_DAY_END",
            message: format!(
                "operating window {}-{} is empty",
                format_time(day_start),
                format_time(day_end)
            ),
        })?;
        let granularity = parsed_var(&lookup, "TIMETABLED_SLOT_GRANULARITY", defaults.granularity)?;

        Ok(Self {
            bind: lookup("TIMETABLED_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed_var(&lookup, "TIMETABLED_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("TIMETABLED_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("TIMETABLED_PASSWORD").unwrap_or_else(|| "timetabled".into()),
            max_connections: parsed_var(&lookup, "TIMETABLED_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed_var(&lookup, "TIMETABLED_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("TIMETABLED_METRICS_PORT")
                .map(|s| parse_var("TIMETABLED_METRICS_PORT", &s))
                .transpose()?,
            tls_cert: lookup("TIMETABLED_TLS_CERT"),
            tls_key: lookup("TIMETABLED_TLS_KEY"),
            directory_file: lookup("TIMETABLED_DIRECTORY").map(PathBuf::from),
            engine: EngineConfig { window, granularity },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("timetable.wal")
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        var,
        message: format!("{raw:?}: {e}"),
    })
}

fn parsed_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => parse_var(var, &raw),
        None => Ok(default),
    }
}

fn time_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Secs,
) -> Result<Secs, ConfigError> {
    match lookup(var) {
        Some(raw) => parse_time(&raw).map_err(|message| ConfigError { var, message }),
        None => Ok(default),
    }
}
