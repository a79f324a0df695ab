// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-only jobs.
//!
//! A timed job has no channel, so the loop never gives it readiness. Its
//! deadline passing, an explicit cancel and shutdown all arrive through
//! `cancelled`; being fired externally arrives through `invoke`, which fires
//! the handoff (if any) and completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::JobError;
use crate::handoff::Handoff;
use crate::interest::Interest;
use crate::job::{Channel, Job, Outcome};
use crate::scheduler::{deadline_after, SchedulerHandle};

/// A job driven purely by its deadline.
///
/// Register with `SchedulerHandle::register_timer`. Both methods default to
/// no-ops; timeouts and heartbeats override `cancelled`.
pub trait TimedJob: Send + 'static {
    /// The deadline passed, or the job was cancelled or shut down.
    fn cancelled(&mut self) {}

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<T: TimedJob> Job for T {
    fn invoke(
        &mut self,
        _channel: Option<Channel<'_>>,
        _ready: Interest,
        handoff: &mut Option<Handoff>,
    ) -> Result<Outcome, JobError> {
        if let Some(h) = handoff.take() {
            h.fire();
        }
        Ok(Outcome::Complete)
    }

    fn cancelled(&mut self) {
        TimedJob::cancelled(self)
    }

    fn describe(&self) -> String {
        TimedJob::describe(self)
    }
}

/// Runs a closure once when the job leaves the scheduler without being
/// fired: on its deadline, on cancel, or on shutdown.
pub struct OnDeadline<F> {
    f: Option<F>,
}

impl<F> OnDeadline<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> TimedJob for OnDeadline<F>
where
    F: FnOnce() + Send + 'static,
{
    fn cancelled(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }

    fn describe(&self) -> String {
        "on-deadline".to_string()
    }
}

/// Stop flag for a `Periodic` job, shared with the code that started it.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Heartbeat: runs `f` once per `period` until `f` returns `false`, the
/// token is cancelled, or the scheduler shuts down.
///
/// Each tick is a fresh registration, so the job key changes every period;
/// stop it through the token rather than `SchedulerHandle::cancel`.
pub struct Periodic<F> {
    tick: Option<Tick<F>>,
}

struct Tick<F> {
    handle: SchedulerHandle,
    period: Duration,
    due: Instant,
    f: F,
    token: Arc<CancelToken>,
}

impl<F> Periodic<F>
where
    F: FnMut() -> bool + Send + 'static,
{
    /// Register the first tick one `period` from now.
    pub fn start(
        handle: &SchedulerHandle,
        period: Duration,
        f: F,
    ) -> Result<Arc<CancelToken>, crate::SchedError> {
        let token = Arc::new(CancelToken::new());
        let due = deadline_after(Instant::now(), period);
        let job = Periodic {
            tick: Some(Tick {
                handle: handle.clone(),
                period,
                due,
                f,
                token: token.clone(),
            }),
        };
        handle.register_timer(job, due)?;
        Ok(token)
    }
}

impl<F> TimedJob for Periodic<F>
where
    F: FnMut() -> bool + Send + 'static,
{
    fn cancelled(&mut self) {
        let Some(mut tick) = self.tick.take() else {
            return;
        };
        // Cancelled or shut down before the tick was due.
        if tick.token.is_cancelled() || Instant::now() < tick.due {
            return;
        }
        if !(tick.f)() {
            debug!("periodic job finished");
            return;
        }

        // Fixed rate; skip missed ticks rather than bursting.
        tick.due = deadline_after(tick.due, tick.period);
        let now = Instant::now();
        if tick.due <= now {
            tick.due = deadline_after(now, tick.period);
        }
        let due = tick.due;
        let handle = tick.handle.clone();
        if let Err(e) = handle.register_timer(Periodic { tick: Some(tick) }, due) {
            debug!(error = %e, "periodic job not rescheduled");
        }
    }

    fn describe(&self) -> String {
        match &self.tick {
            Some(tick) => format!("periodic(every {:?})", tick.period),
            None => "periodic(done)".to_string(),
        }
    }
}
