//! State-machine input events and the bounded input queue.
//!
//! Everything the state machine reacts to — peer messages, timer expiries,
//! and new chain heads — arrives through one queue and is consumed by one
//! cooperative loop, so transitions never need locks.
//!
//! The queue is bounded and *drops the oldest event* on overflow instead of
//! blocking the producer: losing a stale vote is harmless (honest peers
//! re-gossip), and a lost timeout is recovered by the next height's ticker.

use {
    crate::{message::ConsensusMessage, timeout::TimeoutInfo, validator_set::ValidatorSet, PeerId},
    log::warn,
    reimint_types::Header,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
    tokio::sync::Notify,
};

/// One unit of state-machine input.
#[derive(Debug)]
pub enum Event {
    /// A consensus message; `peer` is `None` for self-generated messages.
    Message {
        peer: Option<PeerId>,
        msg: ConsensusMessage,
    },
    /// A timer scheduled by the timeout ticker has fired.
    Timeout(TimeoutInfo),
    /// The block pipeline finished height `header.number`; start the next.
    NewBlockHeader {
        header: Header,
        validators: ValidatorSet,
    },
}

struct Shared {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

/// Cloneable handle to the bounded drop-oldest event queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<Shared>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an event. Never blocks: on overflow the oldest event is
    /// dropped with a warning. Events pushed after `close` are discarded.
    pub fn push(&self, event: Event) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock().expect("event queue poisoned");
            if queue.len() >= self.shared.capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!("event queue full, dropping oldest event: {dropped:?}");
                }
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    /// Dequeue the next event, waiting if the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.shared.queue.lock().expect("event queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Close the queue: producers are cut off, the consumer drains what is
    /// left and then sees `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
