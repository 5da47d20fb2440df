/*

# Overview

SFQ divides traffic into flows by hashing packet headers into a fixed number of buckets, and serves
the resulting flows with deficit round-robin (DRR). Each bucket is backed by its own sub-queue,
created the first time a packet maps to it and kept for the lifetime of the queue disc.

# Classification

Packets are handed to an ordered list of packet filters. The first filter which returns a value
decides the bucket:

  bucket <- value mod flow_count

If no filter matches (wrong address family, not an IP packet) the packet is placed in an overflow
bucket with index flow_count, which is scheduled like any other flow.

Three hash strategies are available per address family:

  * Salted 5-tuple: source, destination, protocol, and ports (TCP/UDP, first fragment only),
    followed by a fixed 32-bit salt.

  * Perturbed address hash: source and destination followed by a salt which is regenerated every
    perturbation period by a task on the event loop. Rotating the salt breaks up persistent
    collisions between unrelated flows.

  * Legacy additive hash:

      k <- src + dst                          (IPv6: xor of the four 32-bit words of each)
      h <- (k + (k >> 8) + ~(k >> 4)) mod (2^20 - 1)

    computed with wrapping 32-bit arithmetic.

# Deficit round-robin

Active flows live in one of two rotation lists, new and old. The new list is always served first.

A flow becomes active (enters the back of the new list) when a packet arrives while it is inactive,
and is given an initial credit of one quantum. On dequeue, the flow at the front of the new list,
or of the old list if the new list is empty, is examined:

  * If its credit is exhausted (credit <= 0), it receives another quantum and moves to the back of
    the old list:

      credit <- credit + quantum

  * Otherwise, if it has a packet, that packet is returned and its size subtracted from the credit.

  * Otherwise the flow is drained. It leaves the rotation and becomes inactive; the next packet to
    arrive re-activates it with a fresh quantum.

A sparse flow which sends less than a quantum between idle periods is therefore always served from
the new list, ahead of bulk flows cycling through the old list.

# Overload

After every enqueue, while the total backlog exceeds the limit (in packets or bytes), the flow with
the largest byte backlog is found and packets are discarded from its head until either
drop_batch_size packets or half of its byte backlog have been removed. At least one packet is
removed per round, so a persistently fat flow absorbs the drops and the limit always holds when
enqueue returns.

Packets discarded this way bypass any management policy of the sub-queue, and are returned to the
caller rather than being silently destroyed.

*/

pub mod error;
pub mod event;
pub mod filter;
pub mod packet;
pub mod queue;
pub mod sfq;

pub use error::ConfigError;
pub use event::EventLoop;
pub use filter::{AddressFamily, PacketFilter, PerturbationConfig};
pub use packet::{Packet, QueueItem};
pub use sfq::{Config, Limit, Sfq};
