//! Subscriber registry
//!
//! Each subscriber owns a bounded status queue and a bounded latency
//! queue of the same depth. Publishing never blocks: when a queue is full
//! the oldest unread entry is evicted so the newest one always gets in.
//!
//! ```text
//! engine ──▶ supervisor ──publish──▶ registry ──try_send──▶ [q] subscriber A
//!                                              └─try_send──▶ [q] subscriber B
//! ```

use crate::status::StatusSample;
use crate::supervisor::{MeasureError, StatusSink, lock_unpoisoned};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Unique identifier for a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber({})", self.0)
    }
}

/// Identifier of one `MeasureLatency` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u64);

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Probe({})", self.0)
    }
}

/// Outcome of one latency probe, delivered out-of-band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyResult {
    pub probe: ProbeId,
    pub outcome: Result<Duration, MeasureError>,
}

impl LatencyResult {
    /// Latency in whole milliseconds, or `-1` if the probe failed
    pub fn delay_millis(&self) -> i64 {
        match &self.outcome {
            Ok(latency) => i64::try_from(latency.as_millis()).unwrap_or(i64::MAX),
            Err(_) => -1,
        }
    }
}

/// Enqueue without blocking, evicting the oldest entries if full.
///
/// `evict_rx` must be a receiver on the same channel as `tx`. Returns how
/// many stale entries were dropped.
fn push_evicting<T>(tx: &Sender<T>, evict_rx: &Receiver<T>, item: T) -> usize {
    let mut pending = item;
    let mut dropped = 0;

    loop {
        match tx.try_send(pending) {
            Ok(()) => return dropped,
            Err(TrySendError::Full(back)) => {
                if evict_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                pending = back;
            }
            Err(TrySendError::Disconnected(_)) => return dropped,
        }
    }
}

struct Slot {
    status_tx: Sender<StatusSample>,
    /// Second receiver on the status queue, used only to evict the oldest entry
    evict_rx: Receiver<StatusSample>,
    latency_tx: Sender<LatencyResult>,
    latency_evict_rx: Receiver<LatencyResult>,
    open: Arc<AtomicBool>,
}

impl Slot {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn push_latest(&self, sample: StatusSample) -> usize {
        push_evicting(&self.status_tx, &self.evict_rx, sample)
    }

    fn push_latency(&self, result: LatencyResult) -> usize {
        push_evicting(&self.latency_tx, &self.latency_evict_rx, result)
    }
}

/// Registry of status subscribers
pub struct SubscriberRegistry {
    slots: Mutex<HashMap<SubscriberId, Slot>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberRegistry {
    /// Create a registry whose queues hold `capacity` entries each
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber and enqueue `initial` as its first sample
    pub fn register(&self, initial: &StatusSample) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (status_tx, status_rx) = crossbeam_channel::bounded(self.capacity);
        let (latency_tx, latency_rx) = crossbeam_channel::bounded(self.capacity);
        let open = Arc::new(AtomicBool::new(true));

        let slot = Slot {
            status_tx,
            evict_rx: status_rx.clone(),
            latency_tx,
            latency_evict_rx: latency_rx.clone(),
            open: open.clone(),
        };
        slot.push_latest(*initial);

        lock_unpoisoned(&self.slots).insert(id, slot);
        debug!("Registered {}", id);

        Subscription {
            id,
            status_rx,
            latency_rx,
            open,
        }
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = lock_unpoisoned(&self.slots).remove(&id).is_some();
        if removed {
            debug!("Unregistered {}", id);
        }
        removed
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.retain(|_, slot| slot.is_open());
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a latency result to every subscriber
    pub fn publish_latency(&self, result: &LatencyResult) {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.retain(|id, slot| {
            if !slot.is_open() {
                debug!("Dropping closed {}", id);
                return false;
            }
            let dropped = slot.push_latency(result.clone());
            if dropped > 0 {
                debug!("{} is not reading latency, dropped {} old result(s)", id, dropped);
            }
            true
        });
    }
}

impl StatusSink for SubscriberRegistry {
    fn publish(&self, sample: &StatusSample) {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.retain(|id, slot| {
            if !slot.is_open() {
                debug!("Dropping closed {}", id);
                return false;
            }
            let dropped = slot.push_latest(*sample);
            if dropped > 0 {
                debug!("{} is lagging, dropped {} stale sample(s)", id, dropped);
            }
            true
        });
    }
}

/// Receiving end of one subscription
///
/// Dropping it closes the subscription; the registry forgets it on the
/// next publish.
pub struct Subscription {
    id: SubscriberId,
    status_rx: Receiver<StatusSample>,
    latency_rx: Receiver<LatencyResult>,
    open: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next queued sample, if any
    pub fn try_recv_status(&self) -> Option<StatusSample> {
        match self.status_rx.try_recv() {
            Ok(sample) => Some(sample),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next sample
    pub fn recv_status_timeout(&self, timeout: Duration) -> Option<StatusSample> {
        match self.status_rx.recv_timeout(timeout) {
            Ok(sample) => Some(sample),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain the queue and return the newest sample
    pub fn latest_status(&self) -> Option<StatusSample> {
        self.status_rx.try_iter().last()
    }

    /// Number of samples waiting
    pub fn pending_status(&self) -> usize {
        self.status_rx.len()
    }

    pub fn try_recv_latency(&self) -> Option<LatencyResult> {
        self.latency_rx.try_recv().ok()
    }

    /// Number of latency results waiting
    pub fn pending_latency(&self) -> usize {
        self.latency_rx.len()
    }

    /// Wait up to `timeout` for the next latency result
    pub fn recv_latency_timeout(&self, timeout: Duration) -> Option<LatencyResult> {
        self.latency_rx.recv_timeout(timeout).ok()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}
