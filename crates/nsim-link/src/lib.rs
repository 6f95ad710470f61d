//! # nsim-link
//!
//! Channel and delivery models for nsim.
//!
//! This crate provides:
//! - Rate and delay parsing ([`DataRate`], [`parse_delay`])
//! - The [`LinkModel`] capability implemented by
//!   [`PointToPointLink`], [`ContentionMedium`] and [`WirelessDomain`]
//! - Pluggable wireless rate selection ([`RateControl`], [`FixedRate`])
//! - The [`ChannelEntity`] that turns link decisions into scheduled arrivals
//!
//! A link model decides *when* and *whether* a frame reaches each receiver;
//! the channel entity schedules one arrival event per receiver and asks the
//! model to resolve it once that instant is reached. Every accepted
//! transmission is resolved exactly once per receiver.

mod channel;
mod contention;
mod point_to_point;
mod wireless;

pub use channel::ChannelEntity;
pub use contention::ContentionMedium;
pub use point_to_point::PointToPointLink;
pub use wireless::{FixedRate, RateControl, WirelessDomain, SPEED_OF_LIGHT_M_S};

use nsim_common::{DeliveryAnomaly, DeviceId, Frame, FrameId, MacAddress, NodeId, SimTime};
use nsim_mobility::MobilityError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Hard limit on devices sharing one contention or wireless domain.
pub const MAX_SHARED_DOMAIN_DEVICES: usize = 250;

/// PPP framing bytes on a point-to-point link.
pub const PPP_OVERHEAD_BYTES: usize = 2;

/// Ethernet header plus FCS on a contention medium.
pub const ETHERNET_OVERHEAD_BYTES: usize = 18;

/// 802.11 data header, LLC/SNAP and FCS on a wireless domain.
pub const WIFI_OVERHEAD_BYTES: usize = 36;

// ============================================================================
// Error Types
// ============================================================================

/// Link-layer errors. Losses are not errors; see [`DeliveryAnomaly`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// Channel is full.
    #[error("{kind} channel accepts at most {limit} devices")]
    TooManyDevices {
        /// Channel kind.
        kind: LinkKind,
        /// Capacity.
        limit: usize,
    },

    /// Device attached twice.
    #[error("device {0} is already attached")]
    DuplicateDevice(DeviceId),

    /// Device not attached to this channel.
    #[error("device {0} is not attached to this channel")]
    UnknownDevice(DeviceId),

    /// No in-flight frame with this id for this receiver.
    #[error("no pending arrival of frame {frame:?} at device {device}")]
    UnknownArrival {
        /// Frame id.
        frame: FrameId,
        /// Receiving device.
        device: DeviceId,
    },

    /// Data rate string could not be parsed.
    #[error("invalid data rate '{0}'")]
    InvalidRate(String),

    /// Delay string could not be parsed.
    #[error("invalid delay '{0}'")]
    InvalidDelay(String),

    /// Wireless reachability needs positions.
    #[error(transparent)]
    Mobility(#[from] MobilityError),
}

// ============================================================================
// Rates and Delays
// ============================================================================

/// Link data rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataRate(u64);

impl DataRate {
    /// Create from bits per second. Zero is rejected.
    pub fn from_bps(bps: u64) -> Result<Self, LinkError> {
        if bps == 0 {
            return Err(LinkError::InvalidRate("0bps".to_string()));
        }
        Ok(DataRate(bps))
    }

    /// Megabits per second shorthand.
    pub fn from_mbps(mbps: u64) -> Self {
        DataRate(mbps.max(1) * 1_000_000)
    }

    /// Bits per second.
    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Time to clock `bytes` onto the wire, rounded up to the next
    /// nanosecond and never zero.
    pub fn tx_time(&self, bytes: usize) -> SimTime {
        let bits = bytes as u128 * 8;
        let ns = (bits * 1_000_000_000).div_ceil(self.0 as u128);
        SimTime::from_nanos((ns as u64).max(1))
    }
}

impl FromStr for DataRate {
    type Err = LinkError;

    /// Parse strings such as `5Mbps`, `100Mb/s`, `500kbps`, `1Gbps` or a plain
    /// number of bits per second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const UNITS: &[(&str, f64)] = &[
            ("Gbps", 1e9),
            ("Gb/s", 1e9),
            ("Mbps", 1e6),
            ("Mb/s", 1e6),
            ("kbps", 1e3),
            ("Kbps", 1e3),
            ("kb/s", 1e3),
            ("bps", 1.0),
            ("b/s", 1.0),
        ];
        let trimmed = s.trim();
        let (number, scale) = UNITS
            .iter()
            .find_map(|(suffix, scale)| trimmed.strip_suffix(suffix).map(|n| (n, *scale)))
            .unwrap_or((trimmed, 1.0));
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| LinkError::InvalidRate(s.to_string()))?;
        let bps = value * scale;
        if !bps.is_finite() || bps < 1.0 {
            return Err(LinkError::InvalidRate(s.to_string()));
        }
        Ok(DataRate(bps.round() as u64))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bps if bps % 1_000_000_000 == 0 => write!(f, "{}Gbps", bps / 1_000_000_000),
            bps if bps % 1_000_000 == 0 => write!(f, "{}Mbps", bps / 1_000_000),
            bps if bps % 1_000 == 0 => write!(f, "{}kbps", bps / 1_000),
            bps => write!(f, "{}bps", bps),
        }
    }
}

/// Parse a propagation delay such as `2ms`, `6560ns`, `10us` or `0.5s`.
/// A bare number is taken as seconds.
pub fn parse_delay(s: &str) -> Result<SimTime, LinkError> {
    const UNITS: &[(&str, f64)] = &[("ns", 1.0), ("us", 1e3), ("ms", 1e6), ("s", 1e9)];
    let trimmed = s.trim();
    let (number, scale) = UNITS
        .iter()
        .find_map(|(suffix, scale)| trimmed.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((trimmed, 1e9));
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| LinkError::InvalidDelay(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(LinkError::InvalidDelay(s.to_string()));
    }
    Ok(SimTime::from_nanos((value * scale).round() as u64))
}

// ============================================================================
// Link Model Capability
// ============================================================================

/// Which delivery model a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Dedicated full-duplex link between exactly two devices.
    PointToPoint,
    /// Shared bus where overlapping transmissions collide.
    Contention,
    /// Broadcast domain with position-dependent reachability.
    Wireless,
}

impl LinkKind {
    /// Device capacity of a channel of this kind.
    pub fn capacity(&self) -> usize {
        match self {
            LinkKind::PointToPoint => 2,
            LinkKind::Contention | LinkKind::Wireless => MAX_SHARED_DOMAIN_DEVICES,
        }
    }

    /// Framing bytes added to every datagram.
    pub fn framing_overhead(&self) -> usize {
        match self {
            LinkKind::PointToPoint => PPP_OVERHEAD_BYTES,
            LinkKind::Contention => ETHERNET_OVERHEAD_BYTES,
            LinkKind::Wireless => WIFI_OVERHEAD_BYTES,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkKind::PointToPoint => "point_to_point",
            LinkKind::Contention => "contention",
            LinkKind::Wireless => "wireless",
        })
    }
}

/// A device attached to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// Device id.
    pub device: DeviceId,
    /// Owning node.
    pub node: NodeId,
    /// Link-layer address.
    pub mac: MacAddress,
}

/// Scheduled arrival of a frame at one receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// Receiving device.
    pub device: DeviceId,
    /// Arrival time, strictly after the transmit call.
    pub at: SimTime,
}

/// An accepted transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    /// Frame id.
    pub frame: FrameId,
    /// Serialization start.
    pub start: SimTime,
    /// Serialization end.
    pub end: SimTime,
    /// One entry per receiver.
    pub arrivals: Vec<Arrival>,
}

/// What a link decided for a transmitted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// In flight; each arrival must later be passed to [`LinkModel::resolve`].
    Scheduled(Transmission),
    /// Lost before any receiver could be scheduled.
    Lost {
        /// Frame id.
        frame: FrameId,
        /// Why.
        anomaly: DeliveryAnomaly,
    },
}

/// Final fate of one scheduled arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// Frame reached the receiver intact.
    Delivered,
    /// Frame was lost on the way.
    Lost(DeliveryAnomaly),
}

/// Delivery model of one channel.
pub trait LinkModel: Send {
    /// Which model this is.
    fn kind(&self) -> LinkKind;

    /// Attach a device. Fails when the channel is full.
    fn attach(&mut self, member: Member) -> Result<(), LinkError>;

    /// Attached devices in attachment order.
    fn members(&self) -> &[Member];

    /// Start sending `frame` from `device` at `now`.
    fn transmit(&mut self, device: DeviceId, frame: &Frame, now: SimTime) -> Result<DeliveryOutcome, LinkError>;

    /// Settle a scheduled arrival once its time has come.
    fn resolve(&mut self, frame: FrameId, device: DeviceId) -> Result<Reception, LinkError>;

    /// Arrivals scheduled but not yet resolved.
    fn in_flight(&self) -> usize;

    /// Look up an attached device.
    fn member(&self, device: DeviceId) -> Option<&Member> {
        self.members().iter().find(|m| m.device == device)
    }
}

// ============================================================================
// Shared Bookkeeping
// ============================================================================

/// Attached devices plus per-device transmit queue state.
#[derive(Debug, Default)]
struct Attachments {
    members: Vec<Member>,
    busy_until: BTreeMap<DeviceId, SimTime>,
    next_frame: u64,
}

impl Attachments {
    fn attach(&mut self, member: Member, kind: LinkKind) -> Result<(), LinkError> {
        if self.members.iter().any(|m| m.device == member.device) {
            return Err(LinkError::DuplicateDevice(member.device));
        }
        if self.members.len() >= kind.capacity() {
            return Err(LinkError::TooManyDevices {
                kind,
                limit: kind.capacity(),
            });
        }
        self.members.push(member);
        Ok(())
    }

    fn sender(&self, device: DeviceId) -> Result<Member, LinkError> {
        self.members
            .iter()
            .find(|m| m.device == device)
            .copied()
            .ok_or(LinkError::UnknownDevice(device))
    }

    /// Members a frame addressed to `dst` is meant for, excluding the sender.
    fn receivers(&self, sender: DeviceId, dst: MacAddress) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| m.device != sender && (dst.is_broadcast() || m.mac == dst))
            .copied()
            .collect()
    }

    fn next_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        id
    }

    /// Earliest time the device's own transmit queue lets a frame start.
    fn earliest_start(&self, device: DeviceId, now: SimTime) -> SimTime {
        self.busy_until.get(&device).copied().unwrap_or(SimTime::ZERO).max(now)
    }

    fn occupy(&mut self, device: DeviceId, until: SimTime) {
        self.busy_until.insert(device, until);
    }
}

/// Outstanding arrivals per frame.
#[derive(Debug, Default)]
struct PendingArrivals {
    arrivals: BTreeSet<(FrameId, DeviceId)>,
}

impl PendingArrivals {
    fn add(&mut self, frame: FrameId, arrivals: &[Arrival]) {
        for a in arrivals {
            self.arrivals.insert((frame, a.device));
        }
    }

    fn take(&mut self, frame: FrameId, device: DeviceId) -> Result<(), LinkError> {
        if self.arrivals.remove(&(frame, device)) {
            Ok(())
        } else {
            Err(LinkError::UnknownArrival { frame, device })
        }
    }

    fn has_frame(&self, frame: FrameId) -> bool {
        self.arrivals
            .range((frame, DeviceId(0))..=(frame, DeviceId(u32::MAX)))
            .next()
            .is_some()
    }

    fn len(&self) -> usize {
        self.arrivals.len()
    }
}
