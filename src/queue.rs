//! Per-flow sub-queues.
//!
//! Every flow owns one sub-queue. Besides normal enqueue/dequeue, sub-queues expose
//! `remove_head`, which bypasses any active queue management and is used by the overload drop
//! policy to discard packets from the front of a flow.

use std::collections::VecDeque;

use tracing::trace;

use super::packet::QueueItem;

const CODEL_TARGET_DEFAULT_MS: u64 = 5;
const CODEL_INTERVAL_DEFAULT_MS: u64 = 100;
const CODEL_MIN_BYTES_DEFAULT: usize = 1500;

pub trait SubQueue<T> {
    fn enqueue(&mut self, item: T, now_ms: u64);

    /// Removes the next item to be served. Items discarded by the queue's own management policy
    /// while looking for that item are appended to `dropped`.
    fn dequeue(&mut self, now_ms: u64, dropped: &mut Vec<T>) -> Option<T>;

    fn peek(&self) -> Option<&T>;

    /// Unconditionally removes the item at the head of the queue.
    fn remove_head(&mut self) -> Option<T>;

    /// Number of items queued.
    fn len(&self) -> usize;

    /// Number of bytes queued.
    fn byte_len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry<T> {
    item: T,
    enqueue_time_ms: u64,
}

// Timestamped FIFO with a running byte count
struct Backlog<T> {
    entries: VecDeque<Entry<T>>,
    bytes: usize,
}

impl<T> Backlog<T>
where
    T: QueueItem,
{
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, item: T, now_ms: u64) {
        self.bytes += item.size();
        self.entries.push_back(Entry {
            item,
            enqueue_time_ms: now_ms,
        });
    }

    fn pop(&mut self) -> Option<Entry<T>> {
        let entry = self.entries.pop_front()?;
        self.bytes -= entry.item.size();
        Some(entry)
    }

    fn peek(&self) -> Option<&T> {
        self.entries.front().map(|entry| &entry.item)
    }
}

/// A plain first-in, first-out queue.
pub struct FifoQueue<T> {
    backlog: Backlog<T>,
}

impl<T> FifoQueue<T>
where
    T: QueueItem,
{
    pub fn new() -> Self {
        Self {
            backlog: Backlog::new(),
        }
    }
}

impl<T> Default for FifoQueue<T>
where
    T: QueueItem,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubQueue<T> for FifoQueue<T>
where
    T: QueueItem,
{
    fn enqueue(&mut self, item: T, now_ms: u64) {
        self.backlog.push(item, now_ms);
    }

    fn dequeue(&mut self, _now_ms: u64, _dropped: &mut Vec<T>) -> Option<T> {
        self.backlog.pop().map(|entry| entry.item)
    }

    fn peek(&self) -> Option<&T> {
        self.backlog.peek()
    }

    fn remove_head(&mut self) -> Option<T> {
        self.backlog.pop().map(|entry| entry.item)
    }

    fn len(&self) -> usize {
        self.backlog.entries.len()
    }

    fn byte_len(&self) -> usize {
        self.backlog.bytes
    }
}

/// Configuration for a [`CodelQueue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodelConfig {
    /// Acceptable standing queue delay, in milliseconds.
    ///
    /// Default value: 5
    pub target_ms: u64,

    /// Window over which the delay must stay above target before dropping begins, in
    /// milliseconds.
    ///
    /// Default value: 100
    pub interval_ms: u64,

    /// Backlog, in bytes, at or below which packets are never dropped.
    ///
    /// Default value: 1500
    pub min_bytes: usize,
}

impl Default for CodelConfig {
    fn default() -> Self {
        Self {
            target_ms: CODEL_TARGET_DEFAULT_MS,
            interval_ms: CODEL_INTERVAL_DEFAULT_MS,
            min_bytes: CODEL_MIN_BYTES_DEFAULT,
        }
    }
}

/// A FIFO with controlled-delay active queue management, dropping at dequeue time when
/// packets have been waiting longer than the target for at least one interval.
pub struct CodelQueue<T> {
    backlog: Backlog<T>,
    config: CodelConfig,
    // Drops since entering the dropping state
    count: u32,
    // Value of count when the dropping state was last entered
    last_count: u32,
    dropping: bool,
    // When the delay went (or will go) continuously above target for one interval
    first_above_time_ms: Option<u64>,
    // Time of the next scheduled drop
    drop_next_ms: u64,
}

impl<T> CodelQueue<T>
where
    T: QueueItem,
{
    pub fn new(config: CodelConfig) -> Self {
        Self {
            backlog: Backlog::new(),
            config,
            count: 0,
            last_count: 0,
            dropping: false,
            first_above_time_ms: None,
            drop_next_ms: 0,
        }
    }

    pub fn is_dropping(&self) -> bool {
        self.dropping
    }

    fn should_drop(&mut self, enqueue_time_ms: u64, now_ms: u64) -> bool {
        let sojourn_ms = now_ms.saturating_sub(enqueue_time_ms);

        if sojourn_ms < self.config.target_ms || self.backlog.bytes <= self.config.min_bytes {
            self.first_above_time_ms = None;
            return false;
        }

        match self.first_above_time_ms {
            Some(first_above_time_ms) => now_ms >= first_above_time_ms,
            None => {
                self.first_above_time_ms = Some(now_ms + self.config.interval_ms);
                false
            }
        }
    }

    fn control_law(&self, time_ms: u64) -> u64 {
        let step = self.config.interval_ms as f64 / f64::from(self.count.max(1)).sqrt();

        time_ms + step as u64
    }
}

impl<T> SubQueue<T> for CodelQueue<T>
where
    T: QueueItem,
{
    fn enqueue(&mut self, item: T, now_ms: u64) {
        self.backlog.push(item, now_ms);
    }

    fn dequeue(&mut self, now_ms: u64, dropped: &mut Vec<T>) -> Option<T> {
        let mut entry = match self.backlog.pop() {
            Some(entry) => entry,
            None => {
                self.dropping = false;
                return None;
            }
        };

        let drop = self.should_drop(entry.enqueue_time_ms, now_ms);

        if self.dropping {
            if !drop {
                self.dropping = false;
            } else {
                while self.dropping && now_ms >= self.drop_next_ms {
                    dropped.push(entry.item);
                    self.count += 1;

                    entry = match self.backlog.pop() {
                        Some(entry) => entry,
                        None => {
                            self.dropping = false;
                            return None;
                        }
                    };

                    if self.should_drop(entry.enqueue_time_ms, now_ms) {
                        self.drop_next_ms = self.control_law(self.drop_next_ms);
                    } else {
                        self.dropping = false;
                    }
                }
            }
        } else if drop {
            dropped.push(entry.item);

            entry = match self.backlog.pop() {
                Some(entry) => entry,
                None => {
                    self.dropping = false;
                    return None;
                }
            };

            self.dropping = true;

            // Resume near the previous drop rate if the last dropping state ended recently
            let delta = self.count.saturating_sub(self.last_count);
            self.count = if delta > 1
                && now_ms.saturating_sub(self.drop_next_ms) < 16 * self.config.interval_ms
            {
                delta
            } else {
                1
            };
            self.last_count = self.count;
            self.drop_next_ms = self.control_law(now_ms);

            trace!(
                count = self.count,
                drop_next_ms = self.drop_next_ms,
                "codel entered dropping state"
            );
        }

        Some(entry.item)
    }

    fn peek(&self) -> Option<&T> {
        self.backlog.peek()
    }

    fn remove_head(&mut self) -> Option<T> {
        self.backlog.pop().map(|entry| entry.item)
    }

    fn len(&self) -> usize {
        self.backlog.entries.len()
    }

    fn byte_len(&self) -> usize {
        self.backlog.bytes
    }
}

/// Selects the sub-queue type created for each flow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SubQueueKind {
    #[default]
    Fifo,
    Codel(CodelConfig),
}

impl SubQueueKind {
    pub fn create<T>(&self) -> Box<dyn SubQueue<T>>
    where
        T: QueueItem + 'static,
    {
        match self {
            Self::Fifo => Box::new(FifoQueue::new()),
            Self::Codel(config) => Box::new(CodelQueue::new(config.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::packet::Packet;

    fn pkt(id: u64, size: usize) -> Packet {
        Packet::raw(id, size)
    }

    #[test]
    fn fifo_order_and_bytes() {
        let mut q = FifoQueue::new();
        let mut dropped = Vec::new();

        assert!(q.is_empty());
        assert_eq!(q.peek(), None);

        q.enqueue(pkt(0, 100), 0);
        q.enqueue(pkt(1, 200), 0);
        q.enqueue(pkt(2, 300), 0);

        assert_eq!(q.len(), 3);
        assert_eq!(q.byte_len(), 600);
        assert_eq!(q.peek().map(|p| p.id), Some(0));

        assert_eq!(q.dequeue(10, &mut dropped).map(|p| p.id), Some(0));
        assert_eq!(q.remove_head().map(|p| p.id), Some(1));
        assert_eq!(q.byte_len(), 300);
        assert_eq!(q.dequeue(10, &mut dropped).map(|p| p.id), Some(2));
        assert_eq!(q.dequeue(10, &mut dropped), None);
        assert_eq!(q.remove_head(), None);

        assert!(dropped.is_empty());
        assert_eq!(q.byte_len(), 0);
    }

    #[test]
    fn codel_no_drop_below_target() {
        let mut q = CodelQueue::new(CodelConfig::default());
        let mut dropped = Vec::new();

        for i in 0..10 {
            q.enqueue(pkt(i, 1000), i * 10);
        }

        for i in 0..10 {
            // Each packet waits 4ms
            let item = q.dequeue(i * 10 + 4, &mut dropped).unwrap();
            assert_eq!(item.id, i);
        }

        assert!(dropped.is_empty());
        assert!(!q.is_dropping());
    }

    #[test]
    fn codel_no_drop_at_min_bytes() {
        let mut q = CodelQueue::new(CodelConfig::default());
        let mut dropped = Vec::new();

        q.enqueue(pkt(0, 1000), 0);
        q.enqueue(pkt(1, 1000), 0);

        // Long sojourn, but the remaining backlog never exceeds min_bytes
        assert_eq!(q.dequeue(1_000, &mut dropped).map(|p| p.id), Some(0));
        assert_eq!(q.dequeue(2_000, &mut dropped).map(|p| p.id), Some(1));

        assert!(dropped.is_empty());
    }

    #[test]
    fn codel_drops_standing_queue() {
        let mut q = CodelQueue::new(CodelConfig::default());
        let mut dropped = Vec::new();

        for i in 0..20 {
            q.enqueue(pkt(i, 1000), 0);
        }

        // Above target, starts the interval timer
        assert_eq!(q.dequeue(10, &mut dropped).map(|p| p.id), Some(0));
        assert!(dropped.is_empty());
        assert!(!q.is_dropping());

        // Interval elapsed, the head is dropped and the next packet delivered
        assert_eq!(q.dequeue(120, &mut dropped).map(|p| p.id), Some(2));
        assert_eq!(dropped.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);
        assert!(q.is_dropping());

        // Before the next scheduled drop
        assert_eq!(q.dequeue(130, &mut dropped).map(|p| p.id), Some(3));
        assert_eq!(dropped.len(), 1);

        // At the next scheduled drop
        assert_eq!(q.dequeue(220, &mut dropped).map(|p| p.id), Some(5));
        assert_eq!(dropped.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 4]);

        assert_eq!(q.len(), 14);
        assert_eq!(q.byte_len(), 14_000);
    }

    #[test]
    fn codel_remove_head_bypasses_aqm() {
        let mut q = CodelQueue::new(CodelConfig::default());

        for i in 0..5 {
            q.enqueue(pkt(i, 1000), 0);
        }

        assert_eq!(q.remove_head().map(|p| p.id), Some(0));
        assert_eq!(q.remove_head().map(|p| p.id), Some(1));
        assert_eq!(q.len(), 3);
        assert!(!q.is_dropping());
    }

    #[test]
    fn kind_creates_queue() {
        let mut fifo = SubQueueKind::Fifo.create::<Packet>();
        let mut codel = SubQueueKind::Codel(CodelConfig::default()).create::<Packet>();

        fifo.enqueue(pkt(0, 10), 0);
        codel.enqueue(pkt(1, 10), 0);

        assert_eq!(fifo.byte_len(), 10);
        assert_eq!(codel.peek().map(|p| p.id), Some(1));
    }
}
