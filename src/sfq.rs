use std::collections::HashMap;
use std::collections::VecDeque;

use tracing::{debug, trace};

use super::error::ConfigError;
use super::filter::{self, PacketFilter};
use super::packet::QueueItem;
use super::queue::{SubQueue, SubQueueKind};

const FLOW_COUNT_DEFAULT: u32 = 1024;
const PACKET_LIMIT_DEFAULT: u32 = 10 * 1024;
const DROP_BATCH_SIZE_DEFAULT: u32 = 64;

/// Hard cap on the total backlog of a queue disc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    Packets(u32),
    Bytes(u64),
}

/// Configuration for an [`Sfq`] queue disc.
#[derive(Clone, Debug)]
pub struct Config {
    /// Credit granted to a flow each time its turn comes around with its credit exhausted, in
    /// bytes. When `None`, the MTU of the attached device is used.
    ///
    /// Minimum value: 1 \
    /// Default value: device MTU
    pub quantum: Option<u32>,

    /// Number of hash buckets. Unclassifiable packets go to an additional overflow bucket with
    /// index `flow_count`.
    ///
    /// Minimum value: 1 \
    /// Default value: 1024
    pub flow_count: u32,

    /// Backlog above which the overload drop policy runs.
    ///
    /// Default value: 10,240 packets
    pub limit: Limit,

    /// Maximum number of packets removed from the fattest flow per overload event.
    ///
    /// Minimum value: 1 \
    /// Default value: 64
    pub drop_batch_size: u32,

    /// Type of queue created for each flow.
    ///
    /// Default value: `SubQueueKind::Fifo`
    pub sub_queue: SubQueueKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quantum: None,
            flow_count: FLOW_COUNT_DEFAULT,
            limit: Limit::Packets(PACKET_LIMIT_DEFAULT),
            drop_batch_size: DROP_BATCH_SIZE_DEFAULT,
            sub_queue: SubQueueKind::Fifo,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.quantum == Some(0) {
            return Err(ConfigError::Zero("quantum"));
        }
        if self.flow_count == 0 {
            return Err(ConfigError::Zero("flow_count"));
        }
        match self.limit {
            Limit::Packets(0) | Limit::Bytes(0) => return Err(ConfigError::Zero("limit")),
            _ => (),
        }
        if self.drop_batch_size == 0 {
            return Err(ConfigError::Zero("drop_batch_size"));
        }

        Ok(())
    }
}

/// Scheduling state of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    /// Not in any rotation list.
    Inactive,
    /// In the new-flow list, served with priority.
    New,
    /// In the old-flow list.
    Old,
}

struct Flow<T> {
    bucket: u32,
    queue: Box<dyn SubQueue<T>>,
    credit: i64,
    status: FlowStatus,
}

/// Snapshot of a flow's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowInfo {
    pub bucket: u32,
    pub credit: i64,
    pub status: FlowStatus,
    pub len: usize,
    pub byte_len: usize,
}

/// Result of an enqueue.
#[derive(Debug)]
pub struct Enqueued<T> {
    /// Bucket the item was placed in.
    pub bucket: u32,
    /// Items removed by the overload drop policy, oldest first. May include the enqueued item.
    pub dropped: Vec<T>,
}

/// Lifetime counters of a queue disc.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Items accepted by enqueue.
    pub enqueued: u64,
    /// Items handed out by dequeue.
    pub dequeued: u64,
    /// Items removed by the overload drop policy.
    pub overlimit_drops: u64,
    /// Items removed by the sub-queues' own management.
    pub codel_drops: u64,
    /// Items which no filter could classify, placed in the overflow bucket.
    pub unclassified: u64,
}

/// Collects the parts of a queue disc and validates them.
pub struct Builder<T> {
    config: Config,
    filters: Vec<PacketFilter>,
    device_mtu: Option<u32>,
    classes: Vec<Box<dyn SubQueue<T>>>,
    internal_queues: Vec<Box<dyn SubQueue<T>>>,
}

impl<T> Builder<T>
where
    T: QueueItem + 'static,
{
    pub fn new(config: Config) -> Self {
        Self {
            config,
            filters: Vec::new(),
            device_mtu: None,
            classes: Vec::new(),
            internal_queues: Vec::new(),
        }
    }

    /// Appends a packet filter. Filters are tried in the order they were added.
    pub fn filter(mut self, filter: PacketFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Attaches the queue disc to a device with the given MTU.
    pub fn device_mtu(mut self, mtu: u32) -> Self {
        self.device_mtu = Some(mtu);
        self
    }

    /// Adds a statically configured class. SFQ creates its own classes, so this always causes
    /// [`Builder::build`] to fail.
    pub fn class(mut self, queue: Box<dyn SubQueue<T>>) -> Self {
        self.classes.push(queue);
        self
    }

    /// Adds an internal queue. SFQ keeps all packets in its flows, so this always causes
    /// [`Builder::build`] to fail.
    pub fn internal_queue(mut self, queue: Box<dyn SubQueue<T>>) -> Self {
        self.internal_queues.push(queue);
        self
    }

    pub fn build(self) -> Result<Sfq<T>, ConfigError> {
        if !self.classes.is_empty() {
            return Err(ConfigError::HasClasses(self.classes.len()));
        }
        if self.filters.is_empty() {
            return Err(ConfigError::NoPacketFilter);
        }
        if !self.internal_queues.is_empty() {
            return Err(ConfigError::HasInternalQueues(self.internal_queues.len()));
        }

        self.config.validate()?;

        let quantum = match (self.config.quantum, self.device_mtu) {
            (Some(quantum), _) => quantum,
            (None, Some(0)) => return Err(ConfigError::Zero("device MTU")),
            (None, Some(mtu)) => {
                debug!(mtu, "setting the quantum to the device MTU");
                mtu
            }
            (None, None) => return Err(ConfigError::NoDevice),
        };

        Ok(Sfq::new(self.config, self.filters, quantum))
    }
}

/// A stochastic fair queueing discipline.
///
/// Packets are hashed into buckets, one flow per bucket, and flows are served by deficit
/// round-robin over two rotation lists. Flows which just became active sit in the new list and
/// are served ahead of the old list; a flow leaves the new list for the old list once it has used
/// up its credit, and leaves either list once it has nothing left to send.
pub struct Sfq<T> {
    filters: Vec<PacketFilter>,
    quantum: u32,
    flow_count: u32,
    limit: Limit,
    drop_batch_size: u32,
    sub_queue: SubQueueKind,
    // All flows ever created, in creation order
    flows: Vec<Flow<T>>,
    // Bucket -> index into flows
    flow_indices: HashMap<u32, usize>,
    new_flows: VecDeque<usize>,
    old_flows: VecDeque<usize>,
    packets: usize,
    bytes: usize,
    stats: Stats,
}

impl<T> Sfq<T>
where
    T: QueueItem + 'static,
{
    fn new(config: Config, filters: Vec<PacketFilter>, quantum: u32) -> Self {
        Self {
            filters,
            quantum,
            flow_count: config.flow_count,
            limit: config.limit,
            drop_batch_size: config.drop_batch_size,
            sub_queue: config.sub_queue,
            flows: Vec::new(),
            flow_indices: HashMap::new(),
            new_flows: VecDeque::new(),
            old_flows: VecDeque::new(),
            packets: 0,
            bytes: 0,
            stats: Stats::default(),
        }
    }

    pub fn builder(config: Config) -> Builder<T> {
        Builder::new(config)
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn flow_count(&self) -> u32 {
        self.flow_count
    }

    /// Bucket index used for packets no filter could classify.
    pub fn overflow_bucket(&self) -> u32 {
        self.flow_count
    }

    pub fn filters(&self) -> &[PacketFilter] {
        &self.filters
    }

    /// Number of items queued across all flows.
    pub fn len(&self) -> usize {
        self.packets
    }

    /// Number of bytes queued across all flows.
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of flows created so far.
    pub fn flows_created(&self) -> usize {
        self.flows.len()
    }

    /// Number of flows currently in a rotation list.
    pub fn flows_active(&self) -> usize {
        self.new_flows.len() + self.old_flows.len()
    }

    /// Returns a snapshot of the flow for `bucket`, if one has been created.
    pub fn flow(&self, bucket: u32) -> Option<FlowInfo> {
        let flow = &self.flows[*self.flow_indices.get(&bucket)?];

        Some(FlowInfo {
            bucket: flow.bucket,
            credit: flow.credit,
            status: flow.status,
            len: flow.queue.len(),
            byte_len: flow.queue.byte_len(),
        })
    }

    /// Buckets in service order: the new list front to back, then the old list.
    pub fn rotation(&self) -> Vec<u32> {
        self.new_flows
            .iter()
            .chain(self.old_flows.iter())
            .map(|&idx| self.flows[idx].bucket)
            .collect()
    }

    /// Maps an item to its bucket without enqueueing it.
    pub fn bucket_for(&self, item: &T) -> u32 {
        match filter::classify(&self.filters, item) {
            Some(value) => value % self.flow_count,
            None => self.flow_count,
        }
    }

    fn flow_index(&mut self, bucket: u32) -> usize {
        if let Some(&idx) = self.flow_indices.get(&bucket) {
            return idx;
        }

        debug!(bucket, "creating a new flow queue");

        let idx = self.flows.len();

        self.flows.push(Flow {
            bucket,
            queue: self.sub_queue.create(),
            credit: 0,
            status: FlowStatus::Inactive,
        });
        self.flow_indices.insert(bucket, idx);

        idx
    }

    fn over_limit(&self) -> bool {
        match self.limit {
            Limit::Packets(limit) => self.packets > limit as usize,
            Limit::Bytes(limit) => self.bytes as u64 > limit,
        }
    }

    /// Classifies and enqueues an item, then enforces the backlog limit.
    pub fn enqueue(&mut self, item: T, now_ms: u64) -> Enqueued<T> {
        let bucket = match filter::classify(&self.filters, &item) {
            Some(value) => value % self.flow_count,
            None => {
                debug!("no filter has been able to classify this packet, using overflow bucket");
                self.stats.unclassified += 1;
                self.flow_count
            }
        };

        let idx = self.flow_index(bucket);
        let size = item.size();

        let flow = &mut self.flows[idx];

        if flow.status == FlowStatus::Inactive {
            flow.status = FlowStatus::New;
            flow.credit = i64::from(self.quantum);
            self.new_flows.push_back(idx);

            trace!(bucket, "flow activated");
        }

        flow.queue.enqueue(item, now_ms);

        self.packets += 1;
        self.bytes += size;
        self.stats.enqueued += 1;

        trace!(bucket, size, backlog = self.packets, "packet enqueued");

        let mut dropped = Vec::new();

        while self.over_limit() {
            if self.drop_from_fattest(&mut dropped).is_none() {
                break;
            }
        }

        Enqueued { bucket, dropped }
    }

    /// Removes packets from the head of the flow with the largest byte backlog, until half of
    /// that backlog or `drop_batch_size` packets have been removed. Returns the flow's bucket.
    fn drop_from_fattest(&mut self, dropped: &mut Vec<T>) -> Option<u32> {
        let mut fattest = None;
        let mut max_backlog = 0;

        for (idx, flow) in self.flows.iter().enumerate() {
            if flow.queue.is_empty() {
                continue;
            }

            let backlog = flow.queue.byte_len();

            if fattest.is_none() || backlog > max_backlog {
                fattest = Some(idx);
                max_backlog = backlog;
            }
        }

        let flow = &mut self.flows[fattest?];

        let threshold = max_backlog / 2;
        let mut removed_bytes = 0;
        let mut count = 0;

        while let Some(item) = flow.queue.remove_head() {
            removed_bytes += item.size();
            count += 1;
            dropped.push(item);

            if count >= self.drop_batch_size || removed_bytes >= threshold {
                break;
            }
        }

        self.packets -= count as usize;
        self.bytes -= removed_bytes;
        self.stats.overlimit_drops += u64::from(count);

        debug!(
            bucket = flow.bucket,
            count, removed_bytes, max_backlog, "dropped packets from fat flow"
        );

        Some(flow.bucket)
    }

    /// Returns the next item according to deficit round-robin, or `None` if nothing is queued.
    pub fn dequeue(&mut self, now_ms: u64) -> Option<T> {
        loop {
            let (status, idx) = if let Some(&idx) = self.new_flows.front() {
                (FlowStatus::New, idx)
            } else if let Some(&idx) = self.old_flows.front() {
                (FlowStatus::Old, idx)
            } else {
                trace!("no flow found to dequeue a packet");
                return None;
            };

            let flow = &mut self.flows[idx];

            if flow.credit <= 0 {
                // Credit exhausted: top up and go to the back of the old list
                flow.credit += i64::from(self.quantum);
                flow.status = FlowStatus::Old;

                match status {
                    FlowStatus::New => self.new_flows.pop_front(),
                    _ => self.old_flows.pop_front(),
                };
                self.old_flows.push_back(idx);

                continue;
            }

            let mut aqm_dropped = Vec::new();
            let item = flow.queue.dequeue(now_ms, &mut aqm_dropped);

            for dropped in aqm_dropped.iter() {
                self.packets -= 1;
                self.bytes -= dropped.size();
            }
            self.stats.codel_drops += aqm_dropped.len() as u64;

            match item {
                Some(item) => {
                    let size = item.size();

                    flow.credit -= size as i64;

                    self.packets -= 1;
                    self.bytes -= size;
                    self.stats.dequeued += 1;

                    trace!(bucket = flow.bucket, size, credit = flow.credit, "packet dequeued");

                    return Some(item);
                }
                None => {
                    // Drained: retire until the next packet arrives
                    flow.status = FlowStatus::Inactive;

                    debug!(bucket = flow.bucket, "flow drained, removing from rotation");

                    match status {
                        FlowStatus::New => self.new_flows.pop_front(),
                        _ => self.old_flows.pop_front(),
                    };
                }
            }
        }
    }

    /// Returns the item at the head of the first flow in rotation order which has one.
    pub fn peek(&self) -> Option<&T> {
        self.new_flows
            .iter()
            .chain(self.old_flows.iter())
            .find_map(|&idx| self.flows[idx].queue.peek())
    }
}
