//! Tunables for the session layer.
//!
//! Every duration is stored in milliseconds so the configuration can be
//! shipped as JSON alongside the app's remote settings.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{invalid_config, SessionResult};
use crate::util::backoff::BackoffConfig;

/// Upper bound for every `*_retention_days` field (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Upper bound for `user_cache_ttl_ms`: one week.
pub const MAX_USER_CACHE_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetrySettings {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: millis(base_delay),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            random_factor: self.jitter,
            ..BackoffConfig::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct JanitorSettings {
    pub enabled: bool,
    pub expired_holds_interval_ms: u64,
    pub retention_interval_ms: u64,
    pub notification_retention_days: i64,
    pub emergency_retention_days: i64,
    pub access_log_retention_days: i64,
    pub chat_retention_days: i64,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expired_holds_interval_ms: 5 * 60 * 1_000,
            retention_interval_ms: 60 * 60 * 1_000,
            notification_retention_days: 30,
            emergency_retention_days: 90,
            access_log_retention_days: 60,
            chat_retention_days: 30,
        }
    }
}

impl JanitorSettings {
    pub fn expired_holds_interval(&self) -> Duration {
        Duration::from_millis(self.expired_holds_interval_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_millis(self.retention_interval_ms)
    }

    fn validate(&self) -> SessionResult<()> {
        if self.enabled && (self.expired_holds_interval_ms == 0 || self.retention_interval_ms == 0)
        {
            return Err(invalid_config("janitor intervals must be non-zero"));
        }
        let retention = [
            ("notification_retention_days", self.notification_retention_days),
            ("emergency_retention_days", self.emergency_retention_days),
            ("access_log_retention_days", self.access_log_retention_days),
            ("chat_retention_days", self.chat_retention_days),
        ];
        for (field, days) in retention {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(invalid_config(format!(
                    "janitor.{field} must be between 1 and {MAX_RETENTION_DAYS}, got {days}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry: RetrySettings,
    pub auth_ready_timeout_ms: u64,
    pub auth_poll_interval_ms: u64,
    pub user_cache_ttl_ms: u64,
    pub notification_feed_limit: usize,
    pub janitor: JanitorSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            auth_ready_timeout_ms: 5_000,
            auth_poll_interval_ms: 100,
            user_cache_ttl_ms: 5 * 60 * 1_000,
            notification_feed_limit: 50,
            janitor: JanitorSettings::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|err| invalid_config(format!("Failed to parse session config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(invalid_config("retry.max_attempts must be at least 1"));
        }
        if self.auth_poll_interval_ms == 0 {
            return Err(invalid_config("auth_poll_interval_ms must be non-zero"));
        }
        if self.user_cache_ttl_ms > MAX_USER_CACHE_TTL_MS {
            return Err(invalid_config(format!(
                "user_cache_ttl_ms must not exceed {MAX_USER_CACHE_TTL_MS}"
            )));
        }
        self.janitor.validate()
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_auth_ready_timeout(mut self, timeout: Duration) -> Self {
        self.auth_ready_timeout_ms = millis(timeout);
        self
    }

    pub fn with_auth_poll_interval(mut self, interval: Duration) -> Self {
        self.auth_poll_interval_ms = millis(interval);
        self
    }

    pub fn with_user_cache_ttl(mut self, ttl: Duration) -> Self {
        self.user_cache_ttl_ms = millis(ttl);
        self
    }

    pub fn with_notification_feed_limit(mut self, limit: usize) -> Self {
        self.notification_feed_limit = limit;
        self
    }

    pub fn with_janitor(mut self, janitor: JanitorSettings) -> Self {
        self.janitor = janitor;
        self
    }

    pub fn auth_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_ready_timeout_ms)
    }

    pub fn auth_poll_interval(&self) -> Duration {
        Duration::from_millis(self.auth_poll_interval_ms)
    }

    pub fn user_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.user_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionErrorCode;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{"retry": {"max_attempts": 5}, "janitor": {"enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert!(!config.janitor.enabled);
        assert_eq!(config.user_cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let error = SessionConfig::from_json_str(r#"{"retry": {"max_attempts": 0}}"#).unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidConfig);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let error = SessionConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidConfig);
    }

    #[test]
    fn retry_settings_map_to_backoff() {
        let backoff = RetrySettings::new(4, Duration::from_millis(100)).backoff();
        assert_eq!(backoff.base_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn retention_days_out_of_range_are_rejected() {
        for json in [
            r#"{"janitor": {"notification_retention_days": -1}}"#,
            r#"{"janitor": {"emergency_retention_days": 0}}"#,
            r#"{"janitor": {"chat_retention_days": 9223372036854775807}}"#,
        ] {
            let error = SessionConfig::from_json_str(json).unwrap_err();
            assert_eq!(error.code, SessionErrorCode::InvalidConfig, "{json}");
        }
        assert!(SessionConfig::from_json_str(r#"{"janitor": {"chat_retention_days": 36500}}"#).is_ok());
    }

    #[test]
    fn oversized_cache_ttl_is_rejected() {
        let error = SessionConfig::from_json_str(r#"{"user_cache_ttl_ms": 18446744073709551615}"#)
            .unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidConfig);
    }

    #[test]
    fn huge_durations_saturate_instead_of_truncating() {
        let config = SessionConfig::default().with_auth_ready_timeout(Duration::MAX);
        assert_eq!(config.auth_ready_timeout_ms, u64::MAX);
        let retry = RetrySettings::new(2, Duration::from_secs(u64::MAX));
        assert_eq!(retry.base_delay_ms, u64::MAX);
    }
}
