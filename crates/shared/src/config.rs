use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {key}: {value}")]
    ParseInt { key: String, value: String },
    #[error("invalid boolean in env var {key}: {value}")]
    ParseBool { key: String, value: String },
}

/// Per-tier scheduler cadences, in seconds between runs.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleIntervals {
    pub cheap_seconds: u64,
    pub medium_seconds: u64,
    pub expensive_seconds: u64,
    pub full_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Source tag written into claims; independently deployed processors use
    /// distinct tags so they never compete for the same rows.
    pub source: String,
    pub worker_concurrency: usize,
    pub claim_batch_size: i64,
    pub lease_ttl_seconds: i64,
    pub per_call_timeout_ms: u64,
    pub per_domain_timeout_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: u64,
    pub sweep_interval_seconds: u64,
    pub shadow_mode: bool,
    pub guardian_liveness_probes: bool,
    pub schedule_enabled: bool,
    pub schedule: ScheduleIntervals,
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let worker_concurrency = parse_u32_env("WORKER_CONCURRENCY", 20)? as usize;

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
            database_url,
            database_max_connections: parse_u32_env("DATABASE_MAX_CONNECTIONS", 25)?,
            source: optional_trimmed_env("PROCESSOR_SOURCE")
                .unwrap_or_else(|| "fleet-crawler".to_string()),
            worker_concurrency,
            claim_batch_size: i64::from(parse_u32_env("CLAIM_BATCH_SIZE", 1)?),
            lease_ttl_seconds: i64::from(parse_u32_env("LEASE_TTL_SECONDS", 900)?),
            per_call_timeout_ms: parse_u64_env("PER_CALL_TIMEOUT_MS", 90_000)?,
            per_domain_timeout_ms: parse_u64_env("PER_DOMAIN_TIMEOUT_MS", 600_000)?,
            circuit_failure_threshold: parse_u32_env("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_cooldown_ms: parse_u64_env("CIRCUIT_COOLDOWN_MS", 60_000)?,
            sweep_interval_seconds: parse_u64_env("SWEEP_INTERVAL_SECONDS", 60)?,
            shadow_mode: parse_bool_env("SHADOW_MODE", false)?,
            guardian_liveness_probes: parse_bool_env("GUARDIAN_LIVENESS_PROBES", false)?,
            schedule_enabled: parse_bool_env("SCHEDULE_ENABLED", true)?,
            schedule: ScheduleIntervals {
                cheap_seconds: parse_u64_env("SCHEDULE_CHEAP_INTERVAL_SECONDS", 3_600)?,
                medium_seconds: parse_u64_env("SCHEDULE_MEDIUM_INTERVAL_SECONDS", 86_400)?,
                expensive_seconds: parse_u64_env("SCHEDULE_EXPENSIVE_INTERVAL_SECONDS", 172_800)?,
                full_seconds: parse_u64_env("SCHEDULE_FULL_INTERVAL_SECONDS", 604_800)?,
            },
        })
    }
}

pub fn optional_trimmed_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_u32_env(key: &str, default: u32) -> Result<u32, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<u32>().map_err(|_| ConfigError::ParseInt {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::ParseInt {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                key: key.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        unsafe {
            env::set_var("CONFIG_TEST_BOOL", "YES");
        }
        assert!(parse_bool_env("CONFIG_TEST_BOOL", false).expect("should parse"));
        unsafe {
            env::set_var("CONFIG_TEST_BOOL", "0");
        }
        assert!(!parse_bool_env("CONFIG_TEST_BOOL", true).expect("should parse"));
        unsafe {
            env::remove_var("CONFIG_TEST_BOOL");
        }
        assert!(parse_bool_env("CONFIG_TEST_BOOL", true).expect("should default"));
    }

    #[test]
    fn integer_parsing_rejects_garbage() {
        unsafe {
            env::set_var("CONFIG_TEST_INT", "not-a-number");
        }
        assert!(parse_u64_env("CONFIG_TEST_INT", 5).is_err());
        unsafe {
            env::remove_var("CONFIG_TEST_INT");
        }
        assert_eq!(parse_u64_env("CONFIG_TEST_INT", 5).expect("default"), 5);
    }
}
