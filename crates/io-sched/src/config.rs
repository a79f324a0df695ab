// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Loaded from TOML, then `IO_SCHED_*` environment overrides, then validated.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name of the loop thread.
    pub thread_name: String,
    /// Upper bound on a single wait when no deadline is pending. `None`
    /// blocks until readiness or a submission.
    pub max_poll_interval_ms: Option<u64>,
    /// Events collected per `epoll_wait` call.
    pub max_events: usize,
    /// Bound on pending submissions. `None` is unbounded.
    pub queue_capacity: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "io-sched".to_string(),
            max_poll_interval_ms: None,
            max_events: 64,
            queue_capacity: None,
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn max_poll_interval(&self) -> Option<Duration> {
        self.max_poll_interval_ms.map(Duration::from_millis)
    }

    /// Apply environment variable overrides.
    ///
    /// - `IO_SCHED_THREAD_NAME` -> `thread_name`
    /// - `IO_SCHED_MAX_POLL_INTERVAL_MS` -> `max_poll_interval_ms`
    /// - `IO_SCHED_MAX_EVENTS` -> `max_events`
    /// - `IO_SCHED_QUEUE_CAPACITY` -> `queue_capacity`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("IO_SCHED_THREAD_NAME") {
            self.thread_name = v;
        }
        if let Ok(v) = std::env::var("IO_SCHED_MAX_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.max_poll_interval_ms = Some(ms);
            }
        }
        if let Ok(v) = std::env::var("IO_SCHED_MAX_EVENTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_events = n;
            }
        }
        if let Ok(v) = std::env::var("IO_SCHED_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.queue_capacity = Some(n);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(ConfigError::Invalid(format!(
                "thread_name {:?} is not a valid thread name",
                self.thread_name
            )));
        }
        if self.max_events == 0 || self.max_events > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_events must be in 1..={}, got {}",
                i32::MAX,
                self.max_events
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1 when set".to_string(),
            ));
        }
        if self.max_poll_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "max_poll_interval_ms of 0 would spin the loop".to_string(),
            ));
        }
        Ok(())
    }
}
