//! # nsim-net
//!
//! Network layer for the simulator.
//!
//! This crate provides:
//!
//! - [`Topology`] - nodes, devices and channels with dense ids, plus the
//!   subnet plan assigned over them.
//! - [`Subnet`] - IPv4 prefixes parsed from base/mask or CIDR notation.
//! - [`populate_routing`] - global shortest-hop routing tables.
//! - [`NodeStack`] - the per-node entity that routes datagrams between
//!   applications and channels.

pub mod address;
pub mod routing;
pub mod stack;
pub mod topology;

pub use address::Subnet;
pub use routing::{egress_channel, populate_routing, Route, RoutingTable};
pub use stack::{Interface, NodeStack, EPHEMERAL_PORT_START};
pub use topology::{ChannelRecord, DeviceRecord, Topology};

use thiserror::Error;

/// Errors raised while building or addressing a topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Malformed, overlapping or otherwise inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A fixed capacity was exceeded.
    #[error("resource limit exceeded: {what} (limit {limit})")]
    ResourceLimit {
        /// What ran out.
        what: String,
        /// The limit that was hit.
        limit: usize,
    },
}
