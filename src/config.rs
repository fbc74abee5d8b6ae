use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::WritePrecision;

/// Prefix shared by every environment variable the collector reads.
pub const ENV_PREFIX: &str = "WANSPEED";

pub const DEFAULT_THREADS: usize = 1;
pub const DEFAULT_BUCKET: &str = "wan_speed";
pub const DEFAULT_ORG: &str = "autogen";
pub const DEFAULT_INFLUXDB_URI: &str = "http://localhost:8086";
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("configuration key must not be empty")]
    EmptyKey,

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Name of the environment variable backing `key`.
pub fn env_var_name(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.to_uppercase())
}

/// Resolves a single setting through `lookup`, falling back to `default`.
///
/// An empty key is rejected before `lookup` is consulted. Variables that are
/// set but empty count as unset.
pub fn resolve<F>(lookup: &F, key: &str, default: Option<&str>) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if key.is_empty() {
        return Err(ConfigError::EmptyKey);
    }

    let value = lookup(&env_var_name(key)).filter(|v| !v.is_empty());
    Ok(value.or_else(|| default.map(str::to_string)))
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match resolve(lookup, key, None)? {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Settings resolved once at startup and shared by reference afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub write_precision: WritePrecision,
    /// Pinned server descriptor file; automatic selection when unset.
    pub speedtest_server: Option<PathBuf>,
    pub speedtest_threads: usize,
    pub influxdb_bucket: String,
    pub influxdb_org: String,
    pub influxdb_uri: String,
    pub influxdb_token: Option<String>,
    pub collection_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let speedtest_threads = parse(&lookup, "speedtest_threads", DEFAULT_THREADS)?;
        if speedtest_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "speedtest_threads".to_string(),
                value: "0".to_string(),
                reason: "at least one transfer thread is required".to_string(),
            });
        }

        let interval_secs = parse(&lookup, "collection_interval", DEFAULT_COLLECTION_INTERVAL_SECS)?;

        Ok(Self {
            write_precision: parse(&lookup, "write_precision", WritePrecision::default())?,
            speedtest_server: resolve(&lookup, "speedtest_server", None)?.map(PathBuf::from),
            speedtest_threads,
            influxdb_bucket: resolve(&lookup, "influxdb_database", Some(DEFAULT_BUCKET))?
                .unwrap_or_default(),
            influxdb_org: resolve(&lookup, "influxdb_retention_policy", Some(DEFAULT_ORG))?
                .unwrap_or_default(),
            influxdb_uri: resolve(&lookup, "influxdb_uri", Some(DEFAULT_INFLUXDB_URI))?
                .unwrap_or_default(),
            influxdb_token: resolve(&lookup, "influxdb_token", None)?,
            collection_interval: Duration::from_secs(interval_secs),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_precision: WritePrecision::default(),
            speedtest_server: None,
            speedtest_threads: DEFAULT_THREADS,
            influxdb_bucket: DEFAULT_BUCKET.to_string(),
            influxdb_org: DEFAULT_ORG.to_string(),
            influxdb_uri: DEFAULT_INFLUXDB_URI.to_string(),
            influxdb_token: None,
            collection_interval: Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS),
        }
    }
}
