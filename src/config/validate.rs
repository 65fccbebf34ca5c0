// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    parse_duration, ConfigFile, DefaultsSection, RawConfigFile, RawDefaultsSection,
    RawSchedulerSection, SchedulerSection,
};
use crate::errors::{DagflowError, Result};
use crate::task::RetryPolicy;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let scheduler = validate_scheduler(&raw.scheduler)?;
        let defaults = validate_defaults(&raw.defaults)?;
        Ok(ConfigFile::new_unchecked(scheduler, defaults))
    }
}

/// Validate a raw config without keeping the result.
pub fn validate_config(raw: &RawConfigFile) -> Result<()> {
    validate_scheduler(&raw.scheduler)?;
    validate_defaults(&raw.defaults)?;
    Ok(())
}

fn validate_scheduler(section: &RawSchedulerSection) -> Result<SchedulerSection> {
    if section.max_concurrent == 0 {
        return Err(DagflowError::ConfigError(
            "[scheduler].max_concurrent must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.event_buffer == 0 {
        return Err(DagflowError::ConfigError(
            "[scheduler].event_buffer must be >= 1 (got 0)".to_string(),
        ));
    }

    let tick_interval = field_duration("scheduler", "tick_interval", &section.tick_interval)?;
    if tick_interval.is_zero() {
        return Err(DagflowError::ConfigError(
            "[scheduler].tick_interval must be greater than zero".to_string(),
        ));
    }
    let timeout_grace = field_duration("scheduler", "timeout_grace", &section.timeout_grace)?;

    Ok(SchedulerSection {
        max_concurrent: section.max_concurrent,
        tick_interval,
        timeout_grace,
        event_buffer: section.event_buffer,
    })
}

fn validate_defaults(section: &RawDefaultsSection) -> Result<DefaultsSection> {
    let backoff = section
        .retry_backoff
        .as_deref()
        .map(|s| field_duration("defaults", "retry_backoff", s))
        .transpose()?
        .unwrap_or(Duration::ZERO);

    let timeout = section
        .timeout
        .as_deref()
        .map(|s| field_duration("defaults", "timeout", s))
        .transpose()?;
    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(DagflowError::ConfigError(
            "[defaults].timeout must be greater than zero".to_string(),
        ));
    }

    Ok(DefaultsSection {
        retry: RetryPolicy::retries(section.retries).with_backoff(backoff),
        timeout,
    })
}

fn field_duration(section: &str, field: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| DagflowError::ConfigError(format!("[{section}].{field}: {e}")))
}
