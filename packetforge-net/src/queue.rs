//! Bounded multi-priority packet queue, decoupling I/O from handler
//! execution.
//!
//! `QueueConfig::thread_safe` is accepted for API compatibility with a host
//! that embeds this queue differently, but every queue in this workspace is
//! shared across a connection's receive task and its dispatch-consumer task
//! via `Arc`, which requires `Sync` regardless of the flag's value — so only
//! the lock-based backend below is provided. See DESIGN.md.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use packetforge_core::packet::{Packet, Priority};

use crate::config::QueueConfig;

/// Per-priority enqueue/dequeue/expired/invalid counters plus dequeue latency
/// and uptime. Populated only when `collect_statistics` is enabled.
#[derive(Debug, Clone, Default)]
pub struct PriorityStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub expired: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub per_priority: [PriorityStats; Priority::COUNT],
    pub mean_dequeue_latency_micros: f64,
    pub uptime_secs: u64,
}

/// Anything the priority queue can order by lane. Implemented for a raw
/// [`Packet`] (this module's own tests) and for `dispatcher::QueuedPacket`,
/// which additionally carries the AEAD receive-nonce captured at parse time
/// so it survives being reordered by this queue ahead of decryption.
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

impl Prioritized for Packet {
    fn priority(&self) -> Priority {
        Packet::priority(self)
    }
}

struct Entry<T> {
    item: T,
    enqueued_at: Instant,
}

struct Lanes<T> {
    lanes: [VecDeque<Entry<T>>; Priority::COUNT],
    total: usize,
}

impl<T> Lanes<T> {
    fn new() -> Lanes<T> {
        Lanes {
            lanes: Default::default(),
            total: 0,
        }
    }
}

/// A function consulted on dequeue to drop items that are no longer valid
/// (e.g. a connection that has since closed). Only invoked when
/// `validate_on_dequeue` is set.
pub type ValidityCheck<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Bounded, priority-ordered queue of items awaiting dispatch.
///
/// Enqueue always appends to its priority's FIFO lane; dequeue scans lanes
/// from `Urgent` down to `Low`, skipping (and counting) expired or invalid
/// entries, and returns the first surviving one. Priorities preempt pull
/// order only — they never reorder items already sitting in a lane. Across
/// lanes, though, this is exactly a reorder relative to arrival: a `Low`
/// item that arrived first can be pulled after a `Urgent` item that arrived
/// later. Anything computed in arrival order (e.g. an AEAD nonce) must be
/// captured before enqueuing, not derived from dequeue order.
pub struct PriorityQueue<T> {
    lanes: Mutex<Lanes<T>>,
    stats: Mutex<QueueStats>,
    max_total: usize,
    per_packet_timeout_ms: u64,
    validate_on_dequeue: bool,
    collect_statistics: bool,
    validity_check: Option<ValidityCheck<T>>,
    started_at: Instant,
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new(config: QueueConfig, validity_check: Option<ValidityCheck<T>>) -> PriorityQueue<T> {
        PriorityQueue {
            lanes: Mutex::new(Lanes::new()),
            stats: Mutex::new(QueueStats::default()),
            max_total: config.max_total,
            per_packet_timeout_ms: config.per_packet_timeout_ms,
            validate_on_dequeue: config.validate_on_dequeue,
            collect_statistics: config.collect_statistics,
            validity_check,
            started_at: Instant::now(),
        }
    }

    /// Appends `item` to its priority's lane. Returns `false` (without
    /// enqueueing) if `max_total > 0` and the queue is already full.
    pub fn enqueue(&self, item: T) -> bool {
        let mut lanes = self.lanes.lock().expect("queue mutex poisoned");
        if self.max_total > 0 && lanes.total >= self.max_total {
            return false;
        }

        let idx = item.priority().index();
        lanes.lanes[idx].push_back(Entry {
            item,
            enqueued_at: Instant::now(),
        });
        lanes.total += 1;

        if self.collect_statistics {
            let mut stats = self.stats.lock().expect("queue stats mutex poisoned");
            stats.per_priority[idx].enqueued += 1;
        }

        true
    }

    /// Pops the first non-expired, valid item, scanning `Urgent` down to
    /// `Low`. Expired/invalid entries along the way are dropped and counted.
    pub fn dequeue(&self) -> Option<T> {
        let mut lanes = self.lanes.lock().expect("queue mutex poisoned");
        let dequeue_started = Instant::now();

        for idx in (0..Priority::COUNT).rev() {
            while let Some(entry) = lanes.lanes[idx].pop_front() {
                lanes.total -= 1;

                if self.per_packet_timeout_ms > 0 {
                    let age_ms = dequeue_started.duration_since(entry.enqueued_at).as_millis() as u64;
                    if age_ms > self.per_packet_timeout_ms {
                        self.record_drop(idx, DropKind::Expired);
                        continue;
                    }
                }

                if self.validate_on_dequeue {
                    if let Some(check) = &self.validity_check {
                        if !check(&entry.item) {
                            self.record_drop(idx, DropKind::Invalid);
                            continue;
                        }
                    }
                }

                if self.collect_statistics {
                    let mut stats = self.stats.lock().expect("queue stats mutex poisoned");
                    stats.per_priority[idx].dequeued += 1;
                    let latency = dequeue_started.elapsed().as_micros() as f64;
                    let dequeued = stats.per_priority[idx].dequeued as f64;
                    stats.mean_dequeue_latency_micros +=
                        (latency - stats.mean_dequeue_latency_micros) / dequeued.max(1.0);
                }

                return Some(entry.item);
            }
        }

        None
    }

    /// Dequeues up to `n` items in the same priority-then-FIFO order as
    /// repeated calls to [`dequeue`].
    pub fn dequeue_batch(&self, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.dequeue() {
                Some(packet) => out.push(packet),
                None => break,
            }
        }
        out
    }

    /// Current occupancy of each priority lane, `Low` first.
    pub fn per_priority_sizes(&self) -> [usize; Priority::COUNT] {
        let lanes = self.lanes.lock().expect("queue mutex poisoned");
        let mut sizes = [0usize; Priority::COUNT];
        for (idx, lane) in lanes.lanes.iter().enumerate() {
            sizes[idx] = lane.len();
        }
        sizes
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = self.stats.lock().expect("queue stats mutex poisoned").clone();
        stats.uptime_secs = self.started_at.elapsed().as_secs();
        stats
    }

    fn record_drop(&self, idx: usize, kind: DropKind) {
        if !self.collect_statistics {
            return;
        }
        let mut stats = self.stats.lock().expect("queue stats mutex poisoned");
        match kind {
            DropKind::Expired => stats.per_priority[idx].expired += 1,
            DropKind::Invalid => stats.per_priority[idx].invalid += 1,
        }
    }
}

enum DropKind {
    Expired,
    Invalid,
}
