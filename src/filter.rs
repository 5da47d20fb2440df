//! Packet filters: map a packet to a 32-bit classification value.
//!
//! Each filter serves one address family and hashes with one of three strategies:
//!
//! * `SaltedTuple` - source, destination, protocol, ports (first fragment of TCP/UDP only), and a
//!   fixed salt.
//! * `Perturbed` - source and destination only, salted with a value which is regenerated
//!   periodically by a task on the event loop.
//! * `Legacy` - the additive address hash `(k + (k >> 8) + ~(k >> 4)) mod (2^20 - 1)`, no salt.
//!
//! A filter returns `None` for items of the wrong address family or without a network header.

use std::cell::{Cell, RefCell};
use std::net::Ipv6Addr;
use std::rc::{Rc, Weak};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use siphasher::sip::SipHasher13;
use tracing::{debug, trace};

use super::event::{EventLoop, Task, TaskAction, TaskId};
use super::packet::{Ipv4Header, Ipv6Header, NetworkHeader, Ports, QueueItem};
use super::packet::{PROTOCOL_TCP, PROTOCOL_UDP};

// (2 << 19) - 1
const LEGACY_MODULUS: u32 = (2 << 19) - 1;

const PERTURBATION_PERIOD_DEFAULT_MS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Configuration for a periodically perturbed filter.
#[derive(Clone, Debug)]
pub struct PerturbationConfig {
    /// Interval between salt changes, in milliseconds. Zero disables rotation, leaving the
    /// initial salt in place.
    ///
    /// Default value: 100
    pub period_ms: u64,

    /// Seed for the salt generator. When `None`, the generator is seeded from system entropy.
    ///
    /// Default value: `None`
    pub seed: Option<u64>,
}

impl Default for PerturbationConfig {
    fn default() -> Self {
        Self {
            period_ms: PERTURBATION_PERIOD_DEFAULT_MS,
            seed: None,
        }
    }
}

struct SaltRotation {
    salt: Cell<u32>,
    rng: RefCell<StdRng>,
    period_ms: u64,
}

impl Task for SaltRotation {
    fn fire(&self, now_ms: u64) -> TaskAction {
        let salt = self.rng.borrow_mut().gen::<u32>();
        self.salt.set(salt);

        debug!(now_ms, salt, "rotated hash perturbation");

        TaskAction::Rearm(self.period_ms)
    }
}

/// Salt state for the perturbed strategy. Owns the rotation task; dropping it cancels the task.
pub struct Perturbation {
    rotation: Rc<SaltRotation>,
    task_id: Option<TaskId>,
}

impl Perturbation {
    fn new(config: &PerturbationConfig, ev: &mut EventLoop) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let rotation = Rc::new(SaltRotation {
            salt: Cell::new(rng.gen::<u32>()),
            rng: RefCell::new(rng),
            period_ms: config.period_ms,
        });

        let task_id = if config.period_ms != 0 {
            let weak: Weak<SaltRotation> = Rc::downgrade(&rotation);
            Some(ev.schedule_after(config.period_ms, weak))
        } else {
            None
        };

        Self { rotation, task_id }
    }

    pub fn salt(&self) -> u32 {
        self.rotation.salt.get()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }
}

pub enum HashStrategy {
    SaltedTuple { salt: u32 },
    Perturbed(Perturbation),
    Legacy,
}

pub struct PacketFilter {
    family: AddressFamily,
    strategy: HashStrategy,
}

fn hash32(buf: &[u8]) -> u32 {
    use core::hash::Hasher;

    let mut hasher = SipHasher13::new();
    hasher.write(buf);

    let h = hasher.finish();

    (h ^ (h >> 32)) as u32
}

fn legacy_hash(s: u32, d: u32) -> u32 {
    let k = s.wrapping_add(d);

    k.wrapping_add(k >> 8).wrapping_add(!(k >> 4)) % LEGACY_MODULUS
}

fn fold_ipv6(addr: &Ipv6Addr) -> u32 {
    addr.octets()
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .fold(0, |acc, word| acc ^ word)
}

fn tuple_ports(protocol: u8, fragment_offset: u16, ports: Option<Ports>) -> Ports {
    if (protocol == PROTOCOL_TCP || protocol == PROTOCOL_UDP) && fragment_offset == 0 {
        ports.unwrap_or_default()
    } else {
        Ports::default()
    }
}

impl PacketFilter {
    /// A filter hashing the full 5-tuple with a fixed salt.
    pub fn salted_tuple(family: AddressFamily, salt: u32) -> Self {
        Self {
            family,
            strategy: HashStrategy::SaltedTuple { salt },
        }
    }

    /// A filter hashing source and destination with a salt that rotates every
    /// `config.period_ms`. The rotation task is registered on `ev` immediately.
    pub fn perturbed(family: AddressFamily, config: &PerturbationConfig, ev: &mut EventLoop) -> Self {
        Self {
            family,
            strategy: HashStrategy::Perturbed(Perturbation::new(config, ev)),
        }
    }

    /// A filter using the unsalted additive address hash.
    pub fn legacy(family: AddressFamily) -> Self {
        Self {
            family,
            strategy: HashStrategy::Legacy,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn strategy(&self) -> &HashStrategy {
        &self.strategy
    }

    /// Returns the salt currently mixed into the hash, if the strategy uses one.
    pub fn salt(&self) -> Option<u32> {
        match self.strategy {
            HashStrategy::SaltedTuple { salt } => Some(salt),
            HashStrategy::Perturbed(ref perturbation) => Some(perturbation.salt()),
            HashStrategy::Legacy => None,
        }
    }

    /// Returns true if `item` carries a header of this filter's address family.
    pub fn check_protocol<T: QueueItem>(&self, item: &T) -> bool {
        match item.network_header() {
            Some(NetworkHeader::Ipv4(_)) => self.family == AddressFamily::Ipv4,
            Some(NetworkHeader::Ipv6(_)) => self.family == AddressFamily::Ipv6,
            None => false,
        }
    }

    /// Classifies `item`, or returns `None` if this filter does not apply to it.
    pub fn classify<T: QueueItem>(&self, item: &T) -> Option<u32> {
        if !self.check_protocol(item) {
            trace!(family = ?self.family, "no match");
            return None;
        }

        let value = match item.network_header()? {
            NetworkHeader::Ipv4(hdr) => self.classify_ipv4(hdr, item.ports()),
            NetworkHeader::Ipv6(hdr) => self.classify_ipv6(hdr, item.ports()),
        };

        trace!(family = ?self.family, value, "classified packet");

        Some(value)
    }

    fn classify_ipv4(&self, hdr: &Ipv4Header, ports: Option<Ports>) -> u32 {
        match self.strategy {
            HashStrategy::SaltedTuple { salt } => {
                let ports = tuple_ports(hdr.protocol, hdr.fragment_offset, ports);

                let mut buf = [0u8; 17];
                buf[0..4].copy_from_slice(&hdr.source.octets());
                buf[4..8].copy_from_slice(&hdr.destination.octets());
                buf[8] = hdr.protocol;
                buf[9..11].copy_from_slice(&ports.source.to_be_bytes());
                buf[11..13].copy_from_slice(&ports.destination.to_be_bytes());
                buf[13..17].copy_from_slice(&salt.to_be_bytes());

                hash32(&buf)
            }
            HashStrategy::Perturbed(ref perturbation) => {
                let mut buf = [0u8; 12];
                buf[0..4].copy_from_slice(&hdr.source.octets());
                buf[4..8].copy_from_slice(&hdr.destination.octets());
                buf[8..12].copy_from_slice(&perturbation.salt().to_be_bytes());

                hash32(&buf)
            }
            HashStrategy::Legacy => legacy_hash(u32::from(hdr.source), u32::from(hdr.destination)),
        }
    }

    fn classify_ipv6(&self, hdr: &Ipv6Header, ports: Option<Ports>) -> u32 {
        match self.strategy {
            HashStrategy::SaltedTuple { salt } => {
                let ports = tuple_ports(hdr.next_header, hdr.fragment_offset, ports);

                let mut buf = [0u8; 41];
                buf[0..16].copy_from_slice(&hdr.source.octets());
                buf[16..32].copy_from_slice(&hdr.destination.octets());
                buf[32] = hdr.next_header;
                buf[33..35].copy_from_slice(&ports.source.to_be_bytes());
                buf[35..37].copy_from_slice(&ports.destination.to_be_bytes());
                buf[37..41].copy_from_slice(&salt.to_be_bytes());

                hash32(&buf)
            }
            HashStrategy::Perturbed(ref perturbation) => {
                let mut buf = [0u8; 36];
                buf[0..16].copy_from_slice(&hdr.source.octets());
                buf[16..32].copy_from_slice(&hdr.destination.octets());
                buf[32..36].copy_from_slice(&perturbation.salt().to_be_bytes());

                hash32(&buf)
            }
            HashStrategy::Legacy => {
                legacy_hash(fold_ipv6(&hdr.source), fold_ipv6(&hdr.destination))
            }
        }
    }
}

/// Runs `item` through `filters` in order. The first filter to produce a value wins.
pub fn classify<T: QueueItem>(filters: &[PacketFilter], item: &T) -> Option<u32> {
    filters.iter().find_map(|filter| filter.classify(item))
}
