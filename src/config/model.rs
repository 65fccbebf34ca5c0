// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::task::RetryPolicy;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// max_concurrent = 4
/// tick_interval = "250ms"
/// timeout_grace = "5s"
/// event_buffer = 256
///
/// [defaults]
/// retries = 1
/// retry_backoff = "2s"
/// timeout = "30m"
/// ```
///
/// Every section and field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    #[serde(default)]
    pub defaults: RawDefaultsSection,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSchedulerSection {
    /// Global cap on simultaneously RUNNING tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Timer tick driving timeouts, recurrence and retry backoff.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    /// Extra time granted past a task's timeout before the scheduler
    /// declares the worker lost.
    #[serde(default = "default_timeout_grace")]
    pub timeout_grace: String,

    /// Capacity of the broadcast channel for scheduler events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_tick_interval() -> String {
    "250ms".to_string()
}

fn default_timeout_grace() -> String {
    "5s".to_string()
}

fn default_event_buffer() -> usize {
    256
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            tick_interval: default_tick_interval(),
            timeout_grace: default_timeout_grace(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// `[defaults]` section: task policies applied when a task declares none.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDefaultsSection {
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub retry_backoff: Option<String>,

    #[serde(default)]
    pub timeout: Option<String>,
}

/// Validated `[scheduler]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSection {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub timeout_grace: Duration,
    pub event_buffer: usize,
}

/// Validated `[defaults]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefaultsSection {
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

/// Validated configuration. Only obtainable through
/// `TryFrom<RawConfigFile>`, see `validate.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub defaults: DefaultsSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(scheduler: SchedulerSection, defaults: DefaultsSection) -> Self {
        Self {
            scheduler,
            defaults,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.scheduler.max_concurrent,
            tick_interval: self.scheduler.tick_interval,
            timeout_grace: self.scheduler.timeout_grace,
            event_buffer: self.scheduler.event_buffer,
            default_retry: self.defaults.retry,
            default_timeout: self.defaults.timeout,
        }
    }
}

/// Runtime settings consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub timeout_grace: Duration,
    pub event_buffer: usize,
    pub default_retry: RetryPolicy,
    pub default_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            tick_interval: Duration::from_millis(250),
            timeout_grace: Duration::from_secs(5),
            event_buffer: default_event_buffer(),
            default_retry: RetryPolicy::none(),
            default_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// Parse durations like `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(60 * 60))),
        unit => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2H"), Ok(Duration::from_secs(7200)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("3d").is_err());
    }
}
