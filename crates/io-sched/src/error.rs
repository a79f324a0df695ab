// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler, job and configuration errors.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors reported to callers of the scheduler API.
///
/// Registration problems are reported synchronously at the call site and
/// never reach the loop. `Poll` is the only variant produced by the loop
/// itself, when the multiplexing primitive fails.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Neither a channel nor a deadline was given, so the job could never fire.
    #[error("job has neither a channel nor a deadline")]
    MissingTarget,

    /// A channel was registered (or updated) with an empty interest mask.
    #[error("interest mask is empty")]
    EmptyInterest,

    /// The channel handle is not an open file descriptor.
    #[error("fd {fd} is not a valid channel: {source}")]
    InvalidChannel {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The submission queue is bounded and currently full.
    #[error("submission queue is full ({capacity} pending requests)")]
    QueueFull { capacity: usize },

    /// The loop has shut down (or is shutting down) and accepts no new work.
    #[error("scheduler is stopped")]
    Stopped,

    /// The wait primitive failed; the loop cancelled every job and exited.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// Setting up the epoll instance, the wake eventfd or the loop thread failed.
    #[error("failed to start scheduler: {0}")]
    Setup(#[source] io::Error),

    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The loop thread panicked outside any job dispatch.
    #[error("scheduler thread panicked: {0}")]
    LoopPanicked(String),
}

/// A job fault. Returned from `Job::invoke`; the job is deregistered and the
/// loop logs the error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),

    /// The job panicked during dispatch. Produced by the loop, not by jobs.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        JobError::Failed(msg.into())
    }
}

/// Errors from loading a `SchedulerConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Outcome of waiting on a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// The job terminated (completed, faulted or was cancelled) without
    /// firing its handoff.
    #[error("job terminated without firing its handoff")]
    Abandoned,

    /// `wait_timeout` elapsed first. The handoff may still fire later.
    #[error("timed out waiting for handoff")]
    TimedOut,
}

/// Convert a caught panic payload into a message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
