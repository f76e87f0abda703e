//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services. The
//! core never reads process-wide environment variables while handling a request; the `*_from_env_value`
//! helpers below exist so binaries can turn raw optional strings into typed values up front.

use crate::constants::{
    DEFAULT_CARE_LOCATION, DEFAULT_EMERGENCY_TOKEN_TTL_HOURS, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_MAX_GRANT_DAYS, EMERGENCY_TOKENS_DIR_NAME, MAX_EMERGENCY_RECORDS, RECORDS_DIR_NAME,
};
use crate::{RecordError, RecordResult};
use chrono::Duration;
use medrec_types::SingleLineText;
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    record_data_dir: PathBuf,
    care_location: SingleLineText,
    emergency_profile_limit: usize,
    emergency_token_ttl: Duration,
    max_grant_duration: Duration,
    max_conflict_retries: u32,
}

impl CoreConfig {
    /// Create a configuration with defaults for everything but the data directory.
    pub fn new(record_data_dir: PathBuf) -> RecordResult<Self> {
        Ok(Self {
            record_data_dir,
            care_location: SingleLineText::new(DEFAULT_CARE_LOCATION)?,
            emergency_profile_limit: MAX_EMERGENCY_RECORDS,
            emergency_token_ttl: Duration::hours(DEFAULT_EMERGENCY_TOKEN_TTL_HOURS),
            max_grant_duration: Duration::days(DEFAULT_MAX_GRANT_DAYS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        })
    }

    pub fn with_care_location(mut self, care_location: impl AsRef<str>) -> RecordResult<Self> {
        self.care_location = SingleLineText::new(care_location)
            .map_err(|e| RecordError::InvalidInput(format!("care location: {e}")))?;
        Ok(self)
    }

    pub fn with_emergency_profile_limit(mut self, limit: usize) -> RecordResult<Self> {
        if limit == 0 || limit > MAX_EMERGENCY_RECORDS {
            return Err(RecordError::InvalidInput(format!(
                "emergency profile limit must be between 1 and {MAX_EMERGENCY_RECORDS}"
            )));
        }
        self.emergency_profile_limit = limit;
        Ok(self)
    }

    pub fn with_emergency_token_ttl(mut self, ttl: Duration) -> RecordResult<Self> {
        if ttl <= Duration::zero() {
            return Err(RecordError::InvalidInput(
                "emergency token ttl must be positive".into(),
            ));
        }
        self.emergency_token_ttl = ttl;
        Ok(self)
    }

    pub fn with_max_grant_duration(mut self, max: Duration) -> RecordResult<Self> {
        if max <= Duration::zero() {
            return Err(RecordError::InvalidInput(
                "maximum grant duration must be positive".into(),
            ));
        }
        self.max_grant_duration = max;
        Ok(self)
    }

    pub fn with_max_conflict_retries(mut self, attempts: u32) -> RecordResult<Self> {
        if attempts == 0 {
            return Err(RecordError::InvalidInput(
                "conflict retries must be at least 1".into(),
            ));
        }
        self.max_conflict_retries = attempts;
        Ok(self)
    }

    pub fn record_data_dir(&self) -> &Path {
        &self.record_data_dir
    }

    pub fn records_dir(&self) -> PathBuf {
        self.record_data_dir.join(RECORDS_DIR_NAME)
    }

    pub fn emergency_tokens_dir(&self) -> PathBuf {
        self.record_data_dir.join(EMERGENCY_TOKENS_DIR_NAME)
    }

    pub fn care_location(&self) -> &SingleLineText {
        &self.care_location
    }

    pub fn emergency_profile_limit(&self) -> usize {
        self.emergency_profile_limit
    }

    pub fn emergency_token_ttl(&self) -> Duration {
        self.emergency_token_ttl
    }

    pub fn max_grant_duration(&self) -> Duration {
        self.max_grant_duration
    }

    pub fn max_conflict_retries(&self) -> u32 {
        self.max_conflict_retries
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: Option<String>) -> RecordResult<Option<T>> {
    trimmed(value)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| RecordError::InvalidInput(format!("{name} must be a number, got '{v}'")))
        })
        .transpose()
}

/// Parse the emergency profile limit; `None` or blank yields the maximum.
pub fn emergency_limit_from_env_value(value: Option<String>) -> RecordResult<usize> {
    Ok(parse_number("emergency limit", value)?.unwrap_or(MAX_EMERGENCY_RECORDS))
}

/// Parse the emergency token ttl in hours; `None` or blank yields the default.
pub fn emergency_ttl_from_env_value(value: Option<String>) -> RecordResult<Duration> {
    let hours: i64 = parse_number("emergency ttl hours", value)?
        .unwrap_or(DEFAULT_EMERGENCY_TOKEN_TTL_HOURS);
    Ok(Duration::hours(hours))
}

/// Parse the maximum grant duration in days; `None` or blank yields the default.
pub fn max_grant_duration_from_env_value(value: Option<String>) -> RecordResult<Duration> {
    let days: i64 = parse_number("max grant days", value)?.unwrap_or(DEFAULT_MAX_GRANT_DAYS);
    Ok(Duration::days(days))
}

/// Parse the conflict retry budget; `None` or blank yields the default.
pub fn conflict_retries_from_env_value(value: Option<String>) -> RecordResult<u32> {
    Ok(parse_number("conflict retries", value)?.unwrap_or(DEFAULT_MAX_CONFLICT_RETRIES))
}
