use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing_subscriber::EnvFilter;

use sfq::filter::{AddressFamily, PacketFilter, PerturbationConfig};
use sfq::packet::{Packet, Ports, PROTOCOL_TCP, PROTOCOL_UDP};
use sfq::{Config, EventLoop, Limit, Sfq};

const DURATION_MS: u64 = 5_000;
const LINK_BYTES_PER_MS: i64 = 1_500;

struct Source {
    name: &'static str,
    host: u8,
    protocol: u8,
    packet_size: usize,
    packets_per_burst: u32,
    interval_ms: u64,
}

#[derive(Default)]
struct Tally {
    sent: u64,
    delivered_bytes: u64,
    dropped: u64,
    max_delay_ms: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sources = [
        Source {
            name: "bulk",
            host: 1,
            protocol: PROTOCOL_TCP,
            packet_size: 1500,
            packets_per_burst: 3,
            interval_ms: 1,
        },
        Source {
            name: "video-a",
            host: 2,
            protocol: PROTOCOL_UDP,
            packet_size: 1000,
            packets_per_burst: 1,
            interval_ms: 3,
        },
        Source {
            name: "video-b",
            host: 3,
            protocol: PROTOCOL_UDP,
            packet_size: 1000,
            packets_per_burst: 1,
            interval_ms: 3,
        },
        Source {
            name: "voip",
            host: 4,
            protocol: PROTOCOL_UDP,
            packet_size: 200,
            packets_per_burst: 1,
            interval_ms: 20,
        },
    ];

    let mut ev = EventLoop::new(0);

    let perturbation = PerturbationConfig {
        period_ms: 100,
        seed: Some(0x5f0),
    };

    let mut disc = Sfq::builder(Config {
        flow_count: 1024,
        limit: Limit::Packets(200),
        ..Default::default()
    })
    .filter(PacketFilter::perturbed(AddressFamily::Ipv4, &perturbation, &mut ev))
    .device_mtu(1500)
    .build()
    .expect("failed to build queue disc");

    let mut tallies = sources.iter().map(|_| Tally::default()).collect::<Vec<_>>();
    let mut enqueue_times = HashMap::new();
    let mut next_id = 0u64;
    let mut link_credit = 0i64;

    let source_of = |id: u64| (id % sources.len() as u64) as usize;

    for now_ms in 0..DURATION_MS {
        ev.advance_to(now_ms);

        for (idx, source) in sources.iter().enumerate() {
            if now_ms % source.interval_ms != 0 {
                continue;
            }

            for _ in 0..source.packets_per_burst {
                // Ids are assigned so that id mod source count recovers the source
                let id = next_id * sources.len() as u64 + idx as u64;
                next_id += 1;

                let packet = Packet::ipv4(
                    id,
                    Ipv4Addr::new(192, 168, 0, source.host),
                    Ipv4Addr::new(10, 0, 0, 1),
                    source.protocol,
                    Some(Ports {
                        source: 40_000 + u16::from(source.host),
                        destination: 443,
                    }),
                    source.packet_size,
                );

                enqueue_times.insert(id, now_ms);
                tallies[idx].sent += 1;

                for dropped in disc.enqueue(packet, now_ms).dropped {
                    enqueue_times.remove(&dropped.id);
                    tallies[source_of(dropped.id)].dropped += 1;
                }
            }
        }

        link_credit = (link_credit + LINK_BYTES_PER_MS).min(LINK_BYTES_PER_MS);

        while link_credit > 0 {
            let packet = match disc.dequeue(now_ms) {
                Some(packet) => packet,
                None => break,
            };

            link_credit -= packet.size as i64;

            let tally = &mut tallies[source_of(packet.id)];
            tally.delivered_bytes += packet.size as u64;

            if let Some(enqueue_time_ms) = enqueue_times.remove(&packet.id) {
                tally.max_delay_ms = tally.max_delay_ms.max(now_ms - enqueue_time_ms);
            }
        }
    }

    println!(
        "{:<10} {:>8} {:>8} {:>12} {:>10} {:>14}",
        "source", "sent", "dropped", "delivered", "kbit/s", "max delay ms"
    );

    for (source, tally) in sources.iter().zip(tallies.iter()) {
        println!(
            "{:<10} {:>8} {:>8} {:>12} {:>10.1} {:>14}",
            source.name,
            tally.sent,
            tally.dropped,
            tally.delivered_bytes,
            tally.delivered_bytes as f64 * 8.0 / DURATION_MS as f64,
            tally.max_delay_ms,
        );
    }

    let stats = disc.stats();

    println!();
    println!(
        "enqueued {}, dequeued {}, overlimit drops {}, flows created {}, backlog {} packets",
        stats.enqueued,
        stats.dequeued,
        stats.overlimit_drops,
        disc.flows_created(),
        disc.len()
    );
}
