// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use handoff between a job and a waiting producer thread.
//!
//! A producer registers a job with a handoff and blocks on the waiter; the
//! job fires the handoff from inside `invoke` once it reaches the point the
//! producer cares about. `fire` consumes the handoff, so it fires at most
//! once. If the job terminates without firing, the handoff is dropped and
//! the waiter sees `HandoffError::Abandoned`.

use std::sync::mpsc;
use std::time::Duration;

use crate::error::HandoffError;

/// Create a connected handoff/waiter pair.
pub fn handoff() -> (Handoff, HandoffWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Handoff { tx }, HandoffWaiter { rx })
}

/// Firing side, handed to `Job::invoke`.
#[derive(Debug)]
pub struct Handoff {
    tx: mpsc::SyncSender<()>,
}

impl Handoff {
    /// Release the waiting thread. Never blocks.
    pub fn fire(self) {
        // Capacity is 1 and this is the only send; a dropped waiter is fine.
        let _ = self.tx.try_send(());
    }
}

/// Waiting side, kept by the producer.
#[derive(Debug)]
pub struct HandoffWaiter {
    rx: mpsc::Receiver<()>,
}

impl HandoffWaiter {
    /// Block until the handoff fires or is abandoned.
    pub fn wait(self) -> Result<(), HandoffError> {
        self.rx.recv().map_err(|_| HandoffError::Abandoned)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), HandoffError> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(HandoffError::TimedOut),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(HandoffError::Abandoned),
        }
    }

    /// Non-blocking check. `None` while the job is still pending.
    pub fn try_wait(&self) -> Option<Result<(), HandoffError>> {
        match self.rx.try_recv() {
            Ok(()) => Some(Ok(())),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(HandoffError::Abandoned)),
        }
    }
}
