use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use sfq::filter::{AddressFamily, PacketFilter};
use sfq::packet::{NetworkHeader, Packet, Ports, PROTOCOL_UDP};
use sfq::{Config, Sfq};

pub fn udp4(id: u64, host: u8, size: usize) -> Packet {
    Packet::ipv4(
        id,
        Ipv4Addr::new(10, 0, 0, host),
        Ipv4Addr::new(10, 1, 0, 1),
        PROTOCOL_UDP,
        Some(Ports {
            source: 6000,
            destination: 7000,
        }),
        size,
    )
}

pub fn udp6(id: u64, host: u16, size: usize) -> Packet {
    Packet::ipv6(
        id,
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, host),
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 1, 1),
        PROTOCOL_UDP,
        Some(Ports {
            source: 6000,
            destination: 7000,
        }),
        size,
    )
}

/// Source host of a packet built by `udp4`.
pub fn host_of(packet: &Packet) -> u8 {
    match packet.header {
        Some(NetworkHeader::Ipv4(ref hdr)) => hdr.source.octets()[3],
        _ => panic!("not an IPv4 test packet"),
    }
}

pub fn salted_disc(config: Config) -> Sfq<Packet> {
    Sfq::builder(config)
        .filter(PacketFilter::salted_tuple(AddressFamily::Ipv4, 0))
        .build()
        .expect("failed to build queue disc")
}

/// Returns `count` hosts, each mapping to a different bucket of `disc`.
pub fn distinct_hosts(disc: &Sfq<Packet>, count: usize) -> Vec<u8> {
    let mut buckets = HashSet::new();

    let hosts = (1..=255u8)
        .filter(|&host| buckets.insert(disc.bucket_for(&udp4(0, host, 1))))
        .take(count)
        .collect::<Vec<_>>();

    assert_eq!(hosts.len(), count, "not enough distinct buckets");

    hosts
}

/// Dequeues everything at time `now_ms`.
pub fn drain(disc: &mut Sfq<Packet>, now_ms: u64) -> Vec<Packet> {
    std::iter::from_fn(|| disc.dequeue(now_ms)).collect()
}
