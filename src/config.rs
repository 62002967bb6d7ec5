//! Relay configuration.
//!
//! [`OutboxConfig`] can be deserialized from any serde source (missing keys
//! take their defaults) or read from `OUTBOX_*` environment variables with
//! [`OutboxConfig::from_env`].

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{Backoff, Janitor, Outbox, RetryPolicy, dispatcher::DispatchSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Attempts before a record is dead-lettered.
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: u32,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub publish_timeout_ms: u64,
    /// `0` disables the stuck-claim reaper.
    pub claim_timeout_secs: u64,
    pub retention_days: u32,
    pub janitor_interval_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: RetryPolicy::DEFAULT_MAX_RETRIES,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 5 * 60 * 1_000,
            backoff_multiplier: 2,
            batch_size: 100,
            poll_interval_ms: 1_000,
            publish_timeout_ms: 10_000,
            claim_timeout_secs: 5 * 60,
            retention_days: 7,
            janitor_interval_secs: 60 * 60,
        }
    }
}

impl OutboxConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value. Unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_retries: read(&lookup, "OUTBOX_MAX_RETRIES", defaults.max_retries)?,
            backoff_initial_ms: read(
                &lookup,
                "OUTBOX_BACKOFF_INITIAL_MS",
                defaults.backoff_initial_ms,
            )?,
            backoff_max_ms: read(&lookup, "OUTBOX_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            backoff_multiplier: read(
                &lookup,
                "OUTBOX_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            )?,
            batch_size: read(&lookup, "OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            poll_interval_ms: read(&lookup, "OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            publish_timeout_ms: read(
                &lookup,
                "OUTBOX_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout_ms,
            )?,
            claim_timeout_secs: read(
                &lookup,
                "OUTBOX_CLAIM_TIMEOUT_SECS",
                defaults.claim_timeout_secs,
            )?,
            retention_days: read(&lookup, "OUTBOX_RETENTION_DAYS", defaults.retention_days)?,
            janitor_interval_secs: read(
                &lookup,
                "OUTBOX_JANITOR_INTERVAL_SECS",
                defaults.janitor_interval_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Longest configurable backoff delay: 30 days.
    pub const MAX_BACKOFF_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

    /// Reject values that would stall the relay or break claim ownership.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("OUTBOX_MAX_RETRIES", self.max_retries == 0),
            ("OUTBOX_BATCH_SIZE", self.batch_size == 0),
            ("OUTBOX_POLL_INTERVAL_MS", self.poll_interval_ms == 0),
            ("OUTBOX_PUBLISH_TIMEOUT_MS", self.publish_timeout_ms == 0),
            ("OUTBOX_JANITOR_INTERVAL_SECS", self.janitor_interval_secs == 0),
        ];
        if let Some((variable, _)) = checks.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::invalid(
                variable,
                "0",
                "must be greater than zero".into(),
            ));
        }

        let backoff = [
            ("OUTBOX_BACKOFF_INITIAL_MS", self.backoff_initial_ms),
            ("OUTBOX_BACKOFF_MAX_MS", self.backoff_max_ms),
        ];
        if let Some((variable, value)) = backoff
            .into_iter()
            .find(|(_, ms)| *ms > Self::MAX_BACKOFF_MS)
        {
            return Err(ConfigError::invalid(
                variable,
                &value.to_string(),
                format!("must be at most {}", Self::MAX_BACKOFF_MS).into(),
            ));
        }

        // Claims are renewed once per publish, so a live claim can be one
        // publish timeout old.
        if self.claim_timeout_secs > 0
            && self.claim_timeout_secs.saturating_mul(1_000) <= self.publish_timeout_ms
        {
            return Err(ConfigError::invalid(
                "OUTBOX_CLAIM_TIMEOUT_SECS",
                &self.claim_timeout_secs.to_string(),
                format!(
                    "must exceed OUTBOX_PUBLISH_TIMEOUT_MS ({}ms)",
                    self.publish_timeout_ms
                )
                .into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_backoff(Backoff::exponential(
            Duration::from_millis(self.backoff_initial_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
        ))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            claim_timeout: (self.claim_timeout_secs > 0)
                .then(|| Duration::from_secs(self.claim_timeout_secs)),
        }
    }

    /// A janitor over `outbox` with the configured retention and interval.
    pub fn janitor<S>(&self, outbox: Outbox<S>) -> Janitor<S> {
        Janitor::new(outbox)
            .with_retention_days(self.retention_days)
            .with_interval(Duration::from_secs(self.janitor_interval_secs))
    }
}

fn read<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Into<tower::BoxError>,
{
    match lookup(variable) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(variable, value.trim(), e.into())),
        _ => Ok(default),
    }
}

/// Error returned when configuration cannot be loaded.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

#[derive(Debug)]
pub enum ConfigErrorKind {
    /// A variable is set to a value that cannot be used.
    Invalid {
        variable: &'static str,
        value: String,
        source: tower::BoxError,
    },
}

impl ConfigError {
    fn invalid(variable: &'static str, value: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid {
                variable,
                value: value.to_owned(),
                source,
            },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }

    /// Name of the offending variable.
    pub fn variable(&self) -> &'static str {
        match &self.kind {
            ConfigErrorKind::Invalid { variable, .. } => *variable,
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::Invalid {
                variable,
                value,
                source,
            } => writeln!(f, "Invalid value `{value}` for {variable}: {source}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConfigErrorKind::Invalid { source, .. } => Some(source.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = OutboxConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, OutboxConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.dispatch_settings(), DispatchSettings::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_MAX_RETRIES", "5"),
            ("OUTBOX_BACKOFF_INITIAL_MS", " 250 "),
            ("OUTBOX_BATCH_SIZE", "10"),
            ("OUTBOX_CLAIM_TIMEOUT_SECS", "0"),
            ("OUTBOX_RETENTION_DAYS", ""),
        ]))
        .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_policy().backoff.initial, Duration::from_millis(250));
        assert_eq!(config.dispatch_settings().batch_size, 10);
        assert_eq!(config.dispatch_settings().claim_timeout, None);
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = OutboxConfig::from_lookup(lookup(&[("OUTBOX_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert_eq!(err.variable(), "OUTBOX_POLL_INTERVAL_MS");
        assert!(err.to_string().starts_with("Invalid value `soon` for OUTBOX_POLL_INTERVAL_MS"));

        let err = OutboxConfig::from_lookup(lookup(&[("OUTBOX_MAX_RETRIES", "0")])).unwrap_err();
        assert_eq!(err.variable(), "OUTBOX_MAX_RETRIES");
    }

    #[test]
    fn partial_documents_deserialize_with_defaults() {
        let config: OutboxConfig =
            serde_json::from_str(r#"{ "retention_days": 30, "batch_size": 25 }"#).unwrap();

        assert_eq!(config.retention_days, 30);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn backoff_beyond_thirty_days_is_rejected() {
        let huge = "9000000000000000000";
        let err = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_BACKOFF_INITIAL_MS", huge),
            ("OUTBOX_BACKOFF_MAX_MS", huge),
        ]))
        .unwrap_err();
        assert_eq!(err.variable(), "OUTBOX_BACKOFF_INITIAL_MS");

        let err = OutboxConfig::from_lookup(lookup(&[("OUTBOX_BACKOFF_MAX_MS", huge)])).unwrap_err();
        assert_eq!(err.variable(), "OUTBOX_BACKOFF_MAX_MS");
    }

    #[test]
    fn claim_timeout_must_outlast_a_publish() {
        let err = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_CLAIM_TIMEOUT_SECS", "10"),
            ("OUTBOX_PUBLISH_TIMEOUT_MS", "10000"),
        ]))
        .unwrap_err();
        assert_eq!(err.variable(), "OUTBOX_CLAIM_TIMEOUT_SECS");

        let config = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_CLAIM_TIMEOUT_SECS", "11"),
            ("OUTBOX_PUBLISH_TIMEOUT_MS", "10000"),
        ]))
        .unwrap();
        assert_eq!(
            config.dispatch_settings().claim_timeout,
            Some(Duration::from_secs(11))
        );
    }
}
