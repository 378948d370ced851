use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use log::{debug, info};
use thiserror::Error;
use tokio::time::Duration;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Known sensors, upper-case MAC -> display name. Empty accepts every RuuviTag.
    pub tags: HashMap<String, String>,
    pub database_url: String,
    pub scan_interval: Duration,
    pub scan_window: Duration,
    pub flush_interval: Duration,
    pub buffer_capacity: usize,
    pub write_max_attempts: u32,
    pub write_backoff_base: Duration,
    pub write_backoff_max: Duration,
    pub write_timeout: Duration,
    pub staleness_threshold: Duration,
    pub max_consecutive_scan_failures: u32,
    pub shutdown_timeout: Duration,
}

impl SensorConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let database_url = vars
            .get("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .cloned()
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let tags = parse_tags(&vars);
        info!("Total tags loaded: {}", tags.len());
        for (mac, name) in &tags {
            debug!("Tag: {} -> {}", mac, name);
        }

        let config = SensorConfig {
            tags,
            database_url,
            scan_interval: secs(&vars, "SCAN_INTERVAL_SECS", 30)?,
            scan_window: secs(&vars, "SCAN_WINDOW_SECS", 10)?,
            flush_interval: secs(&vars, "FLUSH_INTERVAL_SECS", 60)?,
            buffer_capacity: number(&vars, "BUFFER_CAPACITY", 10_000)?,
            write_max_attempts: number(&vars, "WRITE_MAX_ATTEMPTS", 5)?,
            write_backoff_base: millis(&vars, "WRITE_BACKOFF_BASE_MS", 500)?,
            write_backoff_max: millis(&vars, "WRITE_BACKOFF_MAX_MS", 30_000)?,
            write_timeout: secs(&vars, "WRITE_TIMEOUT_SECS", 10)?,
            staleness_threshold: secs(&vars, "STALENESS_THRESHOLD_SECS", 300)?,
            max_consecutive_scan_failures: number(&vars, "MAX_CONSECUTIVE_SCAN_FAILURES", 10)?,
            shutdown_timeout: secs(&vars, "SHUTDOWN_TIMEOUT_SECS", 20)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: String, reason: &str| ConfigError::Invalid {
            key,
            value,
            reason: reason.to_string(),
        };

        if self.scan_interval.is_zero() {
            return Err(invalid("SCAN_INTERVAL_SECS", "0".into(), "must be positive"));
        }
        if self.scan_window.is_zero() || self.scan_window > self.scan_interval {
            return Err(invalid(
                "SCAN_WINDOW_SECS",
                self.scan_window.as_secs().to_string(),
                "must be positive and not longer than SCAN_INTERVAL_SECS",
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("FLUSH_INTERVAL_SECS", "0".into(), "must be positive"));
        }
        if self.buffer_capacity == 0 {
            return Err(invalid("BUFFER_CAPACITY", "0".into(), "must be positive"));
        }
        if self.write_max_attempts == 0 {
            return Err(invalid("WRITE_MAX_ATTEMPTS", "0".into(), "at least one attempt"));
        }
        if self.write_backoff_max < self.write_backoff_base {
            return Err(invalid(
                "WRITE_BACKOFF_MAX_MS",
                self.write_backoff_max.as_millis().to_string(),
                "must not be below WRITE_BACKOFF_BASE_MS",
            ));
        }
        Ok(())
    }
}

/// Display name for a sensor, falling back to its address
pub fn sensor_name<'a>(tags: &'a HashMap<String, String>, device_id: &'a str) -> &'a str {
    tags.get(device_id).map(String::as_str).unwrap_or(device_id)
}

fn parse_tags(vars: &HashMap<String, String>) -> HashMap<String, String> {
    let mut tags = HashMap::new();

    // Try RUUVI_TAGS format first
    if let Some(ruuvi_tags) = vars.get("RUUVI_TAGS") {
        debug!("Found RUUVI_TAGS: '{}'", ruuvi_tags);
        for pair in ruuvi_tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((mac, name)) if !mac.trim().is_empty() && !name.trim().is_empty() => {
                    tags.insert(mac.trim().to_uppercase(), name.trim().to_string());
                }
                _ => debug!("Ignoring malformed tag entry: '{}'", pair),
            }
        }
    } else {
        // Fallback to individual environment variables
        for (key, mac) in vars {
            if let Some(index) = key
                .strip_prefix("RUUVI_TAG_")
                .and_then(|s| s.strip_suffix("_MAC"))
            {
                let name_key = format!("RUUVI_TAG_{}_NAME", index);
                if let Some(name) = vars.get(&name_key) {
                    tags.insert(mac.trim().to_uppercase(), name.trim().to_string());
                }
            }
        }
    }

    tags
}

fn number<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs(vars: &HashMap<String, String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    number(vars, key, default).map(Duration::from_secs)
}

fn millis(vars: &HashMap<String, String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    number(vars, key, default).map(Duration::from_millis)
}
