use std::net::{Ipv4Addr, Ipv6Addr};

pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

/// Decoded IPv4 header fields relevant to classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub fragment_offset: u16,
}

/// Decoded IPv6 header fields relevant to classification.
///
/// `fragment_offset` is taken from the fragment extension header, if present, and is zero
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Header {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub next_header: u8,
    pub fragment_offset: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkHeader {
    Ipv4(Ipv4Header),
    Ipv6(Ipv6Header),
}

/// Transport layer source and destination ports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ports {
    pub source: u16,
    pub destination: u16,
}

/// Anything which may be held by the queue disc.
///
/// Header decoding happens before an item reaches the queue disc; the queue only inspects the
/// decoded fields.
pub trait QueueItem {
    /// Size in bytes, used for credit accounting and byte backlogs.
    fn size(&self) -> usize;

    /// Network layer header, or `None` if the item is not an IP packet.
    fn network_header(&self) -> Option<&NetworkHeader>;

    /// Transport ports, if the transport header could be decoded.
    fn ports(&self) -> Option<Ports>;
}

/// A simple packet carrying decoded headers and a size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub header: Option<NetworkHeader>,
    pub ports: Option<Ports>,
    pub size: usize,
}

impl Packet {
    pub fn ipv4(
        id: u64,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        ports: Option<Ports>,
        size: usize,
    ) -> Self {
        Self {
            id,
            header: Some(NetworkHeader::Ipv4(Ipv4Header {
                source,
                destination,
                protocol,
                fragment_offset: 0,
            })),
            ports,
            size,
        }
    }

    pub fn ipv6(
        id: u64,
        source: Ipv6Addr,
        destination: Ipv6Addr,
        next_header: u8,
        ports: Option<Ports>,
        size: usize,
    ) -> Self {
        Self {
            id,
            header: Some(NetworkHeader::Ipv6(Ipv6Header {
                source,
                destination,
                next_header,
                fragment_offset: 0,
            })),
            ports,
            size,
        }
    }

    /// A packet without a network layer header (ARP, raw frames, etc.)
    pub fn raw(id: u64, size: usize) -> Self {
        Self {
            id,
            header: None,
            ports: None,
            size,
        }
    }

    /// Returns a copy of this packet with the given fragment offset.
    pub fn with_fragment_offset(mut self, offset: u16) -> Self {
        match self.header {
            Some(NetworkHeader::Ipv4(ref mut hdr)) => hdr.fragment_offset = offset,
            Some(NetworkHeader::Ipv6(ref mut hdr)) => hdr.fragment_offset = offset,
            None => (),
        }

        self
    }
}

impl QueueItem for Packet {
    fn size(&self) -> usize {
        self.size
    }

    fn network_header(&self) -> Option<&NetworkHeader> {
        self.header.as_ref()
    }

    fn ports(&self) -> Option<Ports> {
        self.ports
    }
}
