//! The timeout ticker.
//!
//! A single pending `(height, round, step, duration)` slot: scheduling a new
//! timeout replaces any outstanding one, and expiry feeds a
//! [`TimeoutInfo`] back into the state machine's input queue, where it is
//! serialized with every other event.

use {
    crate::{
        event::{Event, EventQueue},
        round_state::Step,
    },
    log::{debug, trace},
    std::time::Duration,
    tokio::{sync::mpsc, task::JoinHandle},
};

/// A scheduled (or fired) timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} for h={} r={} step={}",
            self.duration, self.height, self.round, self.step
        )
    }
}

/// Schedules at most one pending timeout and emits expiries into the state
/// machine's queue.
pub struct TimeoutTicker {
    tx: mpsc::UnboundedSender<TimeoutInfo>,
    handle: JoinHandle<()>,
}

impl TimeoutTicker {
    /// Spawn the ticker task. It runs until the schedule channel closes
    /// (i.e. the ticker is dropped).
    pub fn start(queue: EventQueue) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimeoutInfo>();
        let handle = tokio::spawn(async move {
            let mut pending: Option<TimeoutInfo> = None;
            let mut deadline = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(info) => {
                            trace!("ticker: scheduling {info}");
                            deadline = tokio::time::Instant::now() + info.duration;
                            pending = Some(info);
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                        if let Some(info) = pending.take() {
                            debug!("ticker: fired {info}");
                            queue.push(Event::Timeout(info));
                        }
                    }
                }
            }
            trace!("ticker: schedule channel closed, exiting");
        });
        Self { tx, handle }
    }

    /// Replace the pending timeout.
    pub fn schedule(&self, info: TimeoutInfo) {
        let _ = self.tx.send(info);
    }

    /// Stop the ticker without waiting for a pending timer.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
