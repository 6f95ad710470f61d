//! Units carried through the simulated network: UDP datagrams wrapped in
//! link-layer frames.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Bytes of IPv4 (20) and UDP (8) header accounted on top of a datagram payload.
pub const UDP_IPV4_HEADER_BYTES: usize = 28;

/// Initial time-to-live for locally originated datagrams.
pub const DEFAULT_TTL: u8 = 64;

/// 48-bit link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-ones broadcast address.
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Build the `n`th sequential address (`00:00:00:00:00:01` for `n = 1`).
    pub fn from_index(n: u64) -> Self {
        let bytes = n.to_be_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[2..]);
        MacAddress(addr)
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Source address. Left unspecified by applications; the stack fills it.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Remaining hop budget.
    pub ttl: u8,
    /// Application bytes.
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Create a datagram with an unspecified source and the default TTL.
    pub fn new(dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: Vec<u8>) -> Self {
        Datagram {
            src: Ipv4Addr::UNSPECIFIED,
            dst,
            src_port,
            dst_port,
            ttl: DEFAULT_TTL,
            payload,
        }
    }

    /// Size on the wire including IPv4 and UDP headers.
    pub fn wire_size(&self) -> usize {
        self.payload.len() + UDP_IPV4_HEADER_BYTES
    }
}

/// Identifier a channel assigns to each transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

/// A link-layer frame carrying one datagram between two devices on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sending device's address.
    pub src: MacAddress,
    /// Receiving device's address, or [`MacAddress::BROADCAST`].
    pub dst: MacAddress,
    /// Carried datagram.
    pub datagram: Datagram,
}

impl Frame {
    /// Size on the wire given the link's framing overhead.
    pub fn wire_size(&self, framing_overhead: usize) -> usize {
        self.datagram.wire_size() + framing_overhead
    }
}
