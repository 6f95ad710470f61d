//! Observable events emitted by channels, stacks, mobility and applications.
//!
//! Entities push [`TraceKind`] values into the [`SimContext`](crate::SimContext)
//! while handling an event; the runner drains them in emission order and
//! forwards them to whatever sinks are configured.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::{ChannelId, DeviceId, EntityId, FrameId, NodeId, SimTime, Vector};

/// Expected, non-fatal loss of a transmitted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryAnomaly {
    /// Overlapping transmissions on a contention medium.
    Collision,
    /// Receiver beyond wireless range at transmit time.
    OutOfRange,
    /// No device on the channel matches the destination.
    NoReceiver,
    /// No forwarding entry for the destination.
    NoRoute,
    /// Hop budget exhausted while forwarding.
    TtlExpired,
    /// Datagram reached its host but nothing listens on the port.
    PortUnreachable,
}

impl DeliveryAnomaly {
    /// Stable label used in summaries and ASCII traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeliveryAnomaly::Collision => "collision",
            DeliveryAnomaly::OutOfRange => "out_of_range",
            DeliveryAnomaly::NoReceiver => "no_receiver",
            DeliveryAnomaly::NoRoute => "no_route",
            DeliveryAnomaly::TtlExpired => "ttl_expired",
            DeliveryAnomaly::PortUnreachable => "port_unreachable",
        }
    }
}

impl fmt::Display for DeliveryAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Which side of an echo exchange an application plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRole {
    /// Echo client.
    Client,
    /// Echo server.
    Server,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    /// A device started putting a frame on a channel.
    Transmit {
        /// Channel carrying the frame.
        channel: ChannelId,
        /// Sending node.
        node: NodeId,
        /// Sending device.
        device: DeviceId,
        /// Channel-assigned frame id.
        frame: FrameId,
        /// Bytes on the wire.
        bytes: usize,
        /// Serialization start (may be later than the trace time).
        start: SimTime,
        /// IPv4 source.
        src: Ipv4Addr,
        /// IPv4 destination.
        dst: Ipv4Addr,
        /// First payload bytes, for identification.
        head: Vec<u8>,
    },
    /// A frame arrived intact at a receiving device.
    Deliver {
        /// Channel that carried the frame.
        channel: ChannelId,
        /// Receiving node.
        node: NodeId,
        /// Receiving device.
        device: DeviceId,
        /// Channel-assigned frame id.
        frame: FrameId,
        /// Bytes on the wire.
        bytes: usize,
        /// IPv4 source.
        src: Ipv4Addr,
        /// IPv4 destination.
        dst: Ipv4Addr,
    },
    /// A frame or datagram was lost.
    Drop {
        /// Channel involved, if the loss happened on a link.
        channel: Option<ChannelId>,
        /// Node where the loss was observed.
        node: NodeId,
        /// Device involved, if any.
        device: Option<DeviceId>,
        /// Frame id, if the loss happened on a link.
        frame: Option<FrameId>,
        /// Bytes of the lost unit.
        bytes: usize,
        /// Why it was lost.
        anomaly: DeliveryAnomaly,
    },
    /// A mobile node picked a new leg.
    PositionUpdate {
        /// Moving node.
        node: NodeId,
        /// Position at the update.
        position: Vector,
        /// Velocity of the new leg.
        velocity: Vector,
    },
    /// An application sent a datagram.
    AppSend {
        /// Host node.
        node: NodeId,
        /// Application entity.
        app: EntityId,
        /// Client or server.
        role: AppRole,
        /// Sequence number carried in the payload.
        seq: u32,
        /// Payload bytes.
        bytes: usize,
        /// Remote address.
        peer: Ipv4Addr,
        /// Remote port.
        port: u16,
    },
    /// An application received a datagram.
    AppReceive {
        /// Host node.
        node: NodeId,
        /// Application entity.
        app: EntityId,
        /// Client or server.
        role: AppRole,
        /// Sequence number carried in the payload.
        seq: u32,
        /// Payload bytes.
        bytes: usize,
        /// Remote address.
        peer: Ipv4Addr,
        /// Remote port.
        port: u16,
        /// For clients: whether the echo matched the request byte for byte.
        matched: bool,
    },
}

/// A trace record stamped with the simulation time it was emitted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Emission time.
    pub time: SimTime,
    /// Event details.
    #[serde(flatten)]
    pub kind: TraceKind,
}

impl TraceEvent {
    /// Node the record is attributed to.
    pub fn node(&self) -> NodeId {
        match &self.kind {
            TraceKind::Transmit { node, .. }
            | TraceKind::Deliver { node, .. }
            | TraceKind::Drop { node, .. }
            | TraceKind::PositionUpdate { node, .. }
            | TraceKind::AppSend { node, .. }
            | TraceKind::AppReceive { node, .. } => *node,
        }
    }
}
