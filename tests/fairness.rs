#[allow(dead_code)]
mod common;

use common::traffic::*;

use sfq::filter::{AddressFamily, PacketFilter};
use sfq::sfq::FlowStatus;
use sfq::{Config, Sfq};

fn config(quantum: u32) -> Config {
    Config {
        quantum: Some(quantum),
        ..Default::default()
    }
}

#[test]
fn equal_flows_share_equally() {
    let mut disc = salted_disc(config(1500));
    let hosts = distinct_hosts(&disc, 2);

    for i in 0..100 {
        disc.enqueue(udp4(2 * i, hosts[0], 500), 0);
        disc.enqueue(udp4(2 * i + 1, hosts[1], 500), 0);
    }

    let mut served = [0i32; 2];

    for _ in 0..100 {
        let packet = disc.dequeue(0).unwrap();
        let idx = hosts.iter().position(|&h| h == host_of(&packet)).unwrap();
        served[idx] += 1;
    }

    // Each turn is three packets
    assert!((served[0] - served[1]).abs() <= 3, "{:?}", served);
}

#[test]
fn byte_fairness_with_unequal_packet_sizes() {
    let mut disc = salted_disc(config(1500));
    let hosts = distinct_hosts(&disc, 2);

    for i in 0..40 {
        disc.enqueue(udp4(i, hosts[0], 1500), 0);
    }
    for i in 0..400 {
        disc.enqueue(udp4(1000 + i, hosts[1], 100), 0);
    }

    let mut bytes = [0i64; 2];

    while bytes[0] + bytes[1] < 60_000 {
        let packet = disc.dequeue(0).unwrap();
        let idx = hosts.iter().position(|&h| h == host_of(&packet)).unwrap();
        bytes[idx] += packet.size as i64;
    }

    assert!((bytes[0] - bytes[1]).abs() <= 3000, "{:?}", bytes);
}

#[test]
fn sparse_flow_jumps_ahead_of_bulk() {
    let mut disc = salted_disc(config(1500));
    let hosts = distinct_hosts(&disc, 2);
    let (bulk, sparse) = (hosts[0], hosts[1]);

    for i in 0..100 {
        disc.enqueue(udp4(i, bulk, 1500), 0);
    }

    for _ in 0..5 {
        assert_eq!(host_of(&disc.dequeue(0).unwrap()), bulk);
    }

    let bulk_bucket = disc.bucket_for(&udp4(0, bulk, 1));
    assert_eq!(disc.flow(bulk_bucket).unwrap().status, FlowStatus::Old);

    disc.enqueue(udp4(1000, sparse, 200), 0);

    let packet = disc.dequeue(0).unwrap();
    assert_eq!(packet.id, 1000);
}

#[test]
fn every_packet_delivered_in_flow_order() {
    let mut disc = salted_disc(config(700));
    let hosts = distinct_hosts(&disc, 8);

    let mut id = 0;

    for round in 0..50 {
        for (n, &host) in hosts.iter().enumerate() {
            // Vary sizes per flow and per round
            let size = 64 + (round * 37 + n * 211) % 1400;
            disc.enqueue(udp4(id, host, size), 0);
            id += 1;
        }
    }

    let delivered = drain(&mut disc, 0);

    assert_eq!(delivered.len(), 400);
    assert!(disc.is_empty());
    assert_eq!(disc.byte_len(), 0);

    for &host in hosts.iter() {
        let ids = delivered
            .iter()
            .filter(|p| host_of(p) == host)
            .map(|p| p.id)
            .collect::<Vec<_>>();

        assert_eq!(ids.len(), 50);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    assert_eq!(disc.flows_active(), 0);
    assert_eq!(disc.stats().dequeued, 400);
}

#[test]
fn filter_chain_falls_through_by_family() {
    let mut v4_only = salted_disc(config(1500));

    let enqueued = v4_only.enqueue(udp6(0, 1, 100), 0);
    assert_eq!(enqueued.bucket, v4_only.overflow_bucket());
    assert_eq!(v4_only.stats().unclassified, 1);
    assert_eq!(v4_only.dequeue(0).map(|p| p.id), Some(0));

    let mut dual = Sfq::builder(config(1500))
        .filter(PacketFilter::salted_tuple(AddressFamily::Ipv4, 0))
        .filter(PacketFilter::legacy(AddressFamily::Ipv6))
        .build()
        .unwrap();

    let enqueued = dual.enqueue(udp6(0, 1, 100), 0);
    assert!(enqueued.bucket < dual.flow_count());
    assert_eq!(dual.stats().unclassified, 0);

    let enqueued = dual.enqueue(udp4(1, 1, 100), 0);
    assert!(enqueued.bucket < dual.flow_count());
}

#[test]
fn overflow_bucket_competes_fairly() {
    let mut disc = salted_disc(config(1000));
    let host = distinct_hosts(&disc, 1)[0];

    for i in 0..10 {
        disc.enqueue(udp4(i, host, 500), 0);
        disc.enqueue(sfq::Packet::raw(100 + i, 500), 0);
    }

    let order = drain(&mut disc, 0)
        .into_iter()
        .map(|p| p.id >= 100)
        .collect::<Vec<_>>();

    // Two packets per turn, alternating between the flows
    assert_eq!(
        &order[..8],
        &[false, false, true, true, false, false, true, true]
    );
}
