//! Bounded waits and the shutdown signal
//!
//! Every blocking wait in the engine goes through [`wait_until`]: a
//! condition-variable wait sliced into short polls, with a hard timeout,
//! a periodic alert callback and an optional shutdown check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{AtlasError, Result};

/// Longest single condvar sleep; bounds how stale a missed wakeup can get
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Broadcast shutdown: a flag for polling plus a channel that disconnects
pub(crate) struct ShutdownSignal {
    flag: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            flag: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the only sender wakes every `select!` on the receiver
        self.sender.lock().take();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn receiver(&self) -> Receiver<()> {
        self.receiver.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitPolicy {
    pub timeout: Duration,
    pub alert_interval: Duration,
}

/// Wait on `cond` until `done` holds.
///
/// Fails with `Timeout` once `policy.timeout` elapses and with
/// `Interrupted` when `shutdown` is given and fires. `alert` runs every
/// `policy.alert_interval` while still waiting.
pub(crate) fn wait_until<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    shutdown: Option<&ShutdownSignal>,
    policy: WaitPolicy,
    what: &str,
    mut done: impl FnMut(&mut T) -> bool,
    mut alert: impl FnMut(&T, Duration),
) -> Result<()> {
    let started = Instant::now();
    let mut next_alert = started + policy.alert_interval;

    loop {
        if done(&mut **guard) {
            return Ok(());
        }
        if shutdown.is_some_and(|s| s.is_set()) {
            return Err(AtlasError::Interrupted(format!(
                "shutdown while waiting for {}",
                what
            )));
        }

        let now = Instant::now();
        let elapsed = now - started;
        if elapsed >= policy.timeout {
            return Err(AtlasError::Timeout(format!(
                "waited {:?} for {}",
                elapsed, what
            )));
        }
        if now >= next_alert {
            alert(&**guard, elapsed);
            next_alert = now + policy.alert_interval;
        }

        cond.wait_for(guard, POLL_SLICE.min(policy.timeout - elapsed));
    }
}
