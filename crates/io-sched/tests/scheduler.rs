// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end tests against a scheduler running on its own thread.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use io_sched::{
    Channel, Handoff, HandoffError, Interest, Job, JobError, OnDeadline, Outcome, Periodic,
    SchedError, Scheduler, SchedulerConfig, Target,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start() -> Scheduler {
    init_tracing();
    Scheduler::start(SchedulerConfig::default()).unwrap()
}

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

const PATIENCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Invoked(&'static str, Interest),
    Cancelled(&'static str),
}

/// Reports each call on a channel and completes on the first invoke.
struct Reporter {
    name: &'static str,
    tx: mpsc::Sender<(Event, Instant)>,
}

impl Reporter {
    fn new(name: &'static str, tx: &mpsc::Sender<(Event, Instant)>) -> Self {
        Self {
            name,
            tx: tx.clone(),
        }
    }
}

impl Job for Reporter {
    fn invoke(
        &mut self,
        _channel: Option<Channel<'_>>,
        ready: Interest,
        handoff: &mut Option<Handoff>,
    ) -> Result<Outcome, JobError> {
        let _ = self.tx.send((Event::Invoked(self.name, ready), Instant::now()));
        if let Some(h) = handoff.take() {
            h.fire();
        }
        Ok(Outcome::Complete)
    }

    fn cancelled(&mut self) {
        let _ = self.tx.send((Event::Cancelled(self.name), Instant::now()));
    }

    fn describe(&self) -> String {
        format!("reporter({})", self.name)
    }
}

#[test]
fn timer_only_job_is_cancelled_at_its_deadline() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let registered = Instant::now();
    sched
        .handle()
        .register(Reporter::new("t", &tx), Target::after(Duration::from_millis(50)))
        .unwrap();

    let (event, at) = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(event, Event::Cancelled("t"));
    let elapsed = at - registered;
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    sched.shutdown().unwrap();
}

#[test]
fn readable_channel_invokes_once() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let (mut a, b) = UnixStream::pair().unwrap();
    sched
        .handle()
        .register(Reporter::new("rx", &tx), Target::channel(&b, Interest::READABLE))
        .unwrap();

    a.write_all(b"ping").unwrap();
    let (event, _) = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(event, Event::Invoked("rx", Interest::READABLE));

    // Completed: more data on the same channel goes unnoticed.
    a.write_all(b"again").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    sched.shutdown().unwrap();
}

#[test]
fn regular_file_is_rejected_before_queueing() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let file = std::fs::File::open(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml")).unwrap();
    let h = sched.handle();
    let err = h
        .register(Reporter::new("file", &tx), Target::channel(&file, Interest::READABLE))
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidChannel { .. }), "{err}");
    assert!(h.is_idle());

    // The job was never enqueued, so the loop never calls it.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(h.stats().registered, 0);
    sched.shutdown().unwrap();
}

#[test]
fn far_timeout_never_fires() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let h = sched.handle();
    h.register(Reporter::new("forever", &tx), Target::after(Duration::MAX))
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    sched.shutdown().unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap().0, Event::Cancelled("forever"));
}

#[test]
fn earlier_deadline_expires_first() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let h = sched.handle();
    h.register(Reporter::new("a", &tx), Target::after(Duration::from_millis(100)))
        .unwrap();
    h.register(Reporter::new("b", &tx), Target::after(Duration::from_millis(50)))
        .unwrap();

    let first = rx.recv_timeout(PATIENCE).unwrap();
    let second = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(first.0, Event::Cancelled("b"));
    assert_eq!(second.0, Event::Cancelled("a"));
    assert!(first.1 < second.1);
    sched.shutdown().unwrap();
}

#[test]
fn cancelled_job_is_never_dispatched_again() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let h = sched.handle();
    let key = h
        .register(Reporter::new("c", &tx), Target::after(Duration::from_millis(100)))
        .unwrap();
    h.cancel(key);

    let (event, _) = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(event, Event::Cancelled("c"));

    // Past the first deadline, and a second cancel, change nothing.
    h.cancel(key);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let stats = h.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.expired, 0);
    sched.shutdown().unwrap();
}

/// Drains the socket on every wakeup and rearms until it has seen `limit`
/// wakeups.
struct Drain {
    sock: UnixStream,
    seen: usize,
    limit: usize,
    tx: mpsc::Sender<usize>,
}

impl Job for Drain {
    fn invoke(
        &mut self,
        _channel: Option<Channel<'_>>,
        _ready: Interest,
        _handoff: &mut Option<Handoff>,
    ) -> Result<Outcome, JobError> {
        let mut buf = [0u8; 64];
        loop {
            match self.sock.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.seen += 1;
        let _ = self.tx.send(self.seen);
        if self.seen < self.limit {
            Ok(Outcome::Rearm(Interest::READABLE))
        } else {
            Ok(Outcome::Complete)
        }
    }

    fn cancelled(&mut self) {}
}

#[test]
fn rearmed_job_stays_eligible() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let (mut a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let target = Target::channel(&b, Interest::READABLE);
    sched
        .handle()
        .register(
            Drain {
                sock: b,
                seen: 0,
                limit: 3,
                tx,
            },
            target,
        )
        .unwrap();

    for round in 1..=3 {
        a.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), round);
    }
    a.write_all(b"x").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(wait_for(PATIENCE, || sched.handle().is_idle()));
    sched.shutdown().unwrap();
}

#[test]
fn call_and_wait_through_handoff() {
    let sched = start();
    let (tx, _rx) = mpsc::channel();
    let (mut a, b) = UnixStream::pair().unwrap();
    let h = sched.handle();

    let (_, waiter) = h
        .register_with_handoff(Reporter::new("call", &tx), Target::channel(&b, Interest::READABLE))
        .unwrap();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        a.write_all(b"reply").unwrap();
        a
    });
    assert_eq!(waiter.wait_timeout(PATIENCE), Ok(()));
    writer.join().unwrap();

    // A job that times out never fires its handoff.
    let (_, waiter) = h
        .register_with_handoff(
            OnDeadline::new(|| {}),
            Target::after(Duration::from_millis(10)),
        )
        .unwrap();
    assert_eq!(waiter.wait(), Err(HandoffError::Abandoned));
    sched.shutdown().unwrap();
}

struct Broken;

impl Job for Broken {
    fn invoke(
        &mut self,
        _channel: Option<Channel<'_>>,
        _ready: Interest,
        _handoff: &mut Option<Handoff>,
    ) -> Result<Outcome, JobError> {
        Err(JobError::failed("corrupt frame"))
    }

    fn cancelled(&mut self) {
        panic!("faulted jobs are not cancelled");
    }
}

#[test]
fn faulty_job_does_not_stop_the_loop() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let (mut a, b) = UnixStream::pair().unwrap();
    let h = sched.handle();
    h.register(Broken, Target::channel(&b, Interest::READABLE))
        .unwrap();
    a.write_all(b"x").unwrap();
    assert!(wait_for(PATIENCE, || h.stats().faulted == 1));

    h.register(Reporter::new("after", &tx), Target::after(Duration::from_millis(5)))
        .unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap().0, Event::Cancelled("after"));
    assert_eq!(h.stats().cancelled, 1);
    sched.shutdown().unwrap();
}

#[test]
fn shutdown_cancels_every_job() {
    let sched = start();
    let (tx, rx) = mpsc::channel();
    let (_a, b) = UnixStream::pair().unwrap();
    let h = sched.handle();
    let one = h
        .register(Reporter::new("one", &tx), Target::after(Duration::from_secs(60)))
        .unwrap();
    h.register(Reporter::new("two", &tx), Target::channel(&b, Interest::READABLE))
        .unwrap();
    h.register(
        Reporter::new("three", &tx),
        Target::channel(&b, Interest::READABLE).with_timeout(Duration::from_secs(60)),
    )
    .unwrap();

    sched.shutdown().unwrap();
    let events: Vec<Event> = rx.try_iter().map(|(e, _)| e).collect();
    // "three" took over the channel from "two"; everything else was cancelled
    // at shutdown.
    assert_eq!(
        events,
        vec![
            Event::Cancelled("two"),
            Event::Cancelled("one"),
            Event::Cancelled("three"),
        ]
    );

    assert!(h.is_stopped());
    assert!(matches!(
        h.register(Reporter::new("late", &tx), Target::after(Duration::ZERO)),
        Err(SchedError::Stopped)
    ));
    h.cancel(one);
    assert!(rx.try_recv().is_err());
}

#[test]
fn periodic_job_runs_until_it_says_stop() {
    let sched = start();
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    Periodic::start(&sched.handle(), Duration::from_millis(5), move || {
        t.fetch_add(1, Ordering::SeqCst) + 1 < 3
    })
    .unwrap();

    assert!(wait_for(PATIENCE, || ticks.load(Ordering::SeqCst) == 3));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert!(wait_for(PATIENCE, || sched.handle().is_idle()));
    sched.shutdown().unwrap();
}

#[test]
fn periodic_job_stops_on_token() {
    let sched = start();
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let token = Periodic::start(&sched.handle(), Duration::from_millis(5), move || {
        t.fetch_add(1, Ordering::SeqCst);
        true
    })
    .unwrap();

    assert!(wait_for(PATIENCE, || ticks.load(Ordering::SeqCst) >= 2));
    token.cancel();
    assert!(wait_for(PATIENCE, || sched.handle().is_idle()));
    let stopped_at = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
    sched.shutdown().unwrap();
}

#[test]
fn dropping_the_scheduler_shuts_it_down() {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let h = {
        let sched = Scheduler::start(SchedulerConfig::default()).unwrap();
        let h = sched.handle();
        h.register(Reporter::new("pending", &tx), Target::after(Duration::from_secs(60)))
            .unwrap();
        h
    };
    assert_eq!(rx.try_recv().unwrap().0, Event::Cancelled("pending"));
    assert!(h.is_stopped());
}
