//! Nodes, devices and channels, and the address plan over them.

use std::net::Ipv4Addr;

use nsim_common::{ChannelId, DeviceId, MacAddress, NodeId};
use nsim_link::LinkKind;

use crate::{Subnet, TopologyError};

/// A device as recorded in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device id.
    pub id: DeviceId,
    /// Owning node.
    pub node: NodeId,
    /// Channel the device is attached to.
    pub channel: ChannelId,
    /// Link-layer address.
    pub mac: MacAddress,
    /// Assigned IPv4 address, once its channel has a subnet.
    pub address: Option<Ipv4Addr>,
}

/// A channel as recorded in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Channel id.
    pub id: ChannelId,
    /// Delivery model.
    pub kind: LinkKind,
    /// Attached devices in attachment order.
    pub devices: Vec<DeviceId>,
    /// Assigned subnet.
    pub subnet: Option<Subnet>,
}

/// Immutable-once-built graph of nodes, devices and channels.
///
/// Ids are dense and allocated in creation order; nothing is ever removed
/// and a device stays on the channel it was attached to.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<Vec<DeviceId>>,
    devices: Vec<DeviceRecord>,
    channels: Vec<ChannelRecord>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    pub fn create_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Vec::new());
        id
    }

    /// Add `count` nodes, returning their ids in order.
    pub fn create_nodes(&mut self, count: usize) -> Vec<NodeId> {
        (0..count).map(|_| self.create_node()).collect()
    }

    /// Add a channel of the given kind.
    pub fn create_channel(&mut self, kind: LinkKind) -> ChannelId {
        let id = ChannelId(self.channels.len() as u32);
        self.channels.push(ChannelRecord {
            id,
            kind,
            devices: Vec::new(),
            subnet: None,
        });
        id
    }

    /// Create a device on `node` attached to `channel`.
    ///
    /// Point-to-point channels take two devices, shared channels
    /// [`nsim_link::MAX_SHARED_DOMAIN_DEVICES`].
    pub fn attach_device(&mut self, node: NodeId, channel: ChannelId) -> Result<DeviceId, TopologyError> {
        if node.index() >= self.nodes.len() {
            return Err(TopologyError::Configuration(format!("unknown node {}", node)));
        }
        let id = DeviceId(self.devices.len() as u32);
        let record = self
            .channels
            .get_mut(channel.index())
            .ok_or_else(|| TopologyError::Configuration(format!("unknown channel {}", channel)))?;
        let limit = record.kind.capacity();
        if record.devices.len() >= limit {
            return Err(TopologyError::ResourceLimit {
                what: format!("devices on {} channel {}", record.kind, channel),
                limit,
            });
        }
        record.devices.push(id);
        self.nodes[node.index()].push(id);
        self.devices.push(DeviceRecord {
            id,
            node,
            channel,
            mac: MacAddress::from_index(id.0 as u64 + 1),
            address: None,
        });
        Ok(id)
    }

    /// Assign host addresses from `subnet` to the channel's devices in
    /// attachment order, starting at `.1`.
    pub fn assign(&mut self, channel: ChannelId, subnet: Subnet) -> Result<Vec<(DeviceId, Ipv4Addr)>, TopologyError> {
        let record = self
            .channels
            .get(channel.index())
            .ok_or_else(|| TopologyError::Configuration(format!("unknown channel {}", channel)))?;
        if let Some(existing) = record.subnet {
            return Err(TopologyError::Configuration(format!(
                "channel {} already uses subnet {}",
                channel, existing
            )));
        }
        if let Some(clash) = self
            .channels
            .iter()
            .filter_map(|c| c.subnet.map(|s| (c.id, s)))
            .find(|(_, s)| s.overlaps(&subnet))
        {
            return Err(TopologyError::Configuration(format!(
                "subnet {} overlaps {} already assigned to channel {}",
                subnet, clash.1, clash.0
            )));
        }
        if record.devices.len() as u64 > subnet.host_capacity() {
            return Err(TopologyError::ResourceLimit {
                what: format!("host addresses in {}", subnet),
                limit: subnet.host_capacity() as usize,
            });
        }

        let devices = record.devices.clone();
        let mut assigned = Vec::with_capacity(devices.len());
        for (i, device) in devices.into_iter().enumerate() {
            let addr = subnet
                .host(i as u64 + 1)
                .ok_or_else(|| TopologyError::ResourceLimit {
                    what: format!("host addresses in {}", subnet),
                    limit: subnet.host_capacity() as usize,
                })?;
            self.devices[device.index()].address = Some(addr);
            assigned.push((device, addr));
        }
        self.channels[channel.index()].subnet = Some(subnet);
        Ok(assigned)
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All node ids.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    /// Devices of a node in creation order.
    pub fn devices_of(&self, node: NodeId) -> &[DeviceId] {
        self.nodes.get(node.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look up a device.
    pub fn device(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id.index())
    }

    /// All devices.
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    /// Look up a channel.
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(id.index())
    }

    /// All channels.
    pub fn channels(&self) -> &[ChannelRecord] {
        &self.channels
    }

    /// Address of a node's device on `channel`.
    pub fn address_on(&self, node: NodeId, channel: ChannelId) -> Option<Ipv4Addr> {
        self.devices_of(node)
            .iter()
            .filter_map(|d| self.device(*d))
            .find(|d| d.channel == channel)
            .and_then(|d| d.address)
    }

    /// All addresses of a node.
    pub fn addresses_of(&self, node: NodeId) -> Vec<Ipv4Addr> {
        self.devices_of(node)
            .iter()
            .filter_map(|d| self.device(*d).and_then(|r| r.address))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_stable() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(3);
        assert_eq!(nodes, vec![NodeId(0), NodeId(1), NodeId(2)]);
        let lan = topo.create_channel(LinkKind::Contention);
        let d0 = topo.attach_device(NodeId(2), lan).unwrap();
        let d1 = topo.attach_device(NodeId(0), lan).unwrap();
        assert_eq!((d0, d1), (DeviceId(0), DeviceId(1)));
        assert_eq!(topo.devices_of(NodeId(2)), &[DeviceId(0)]);
        assert_eq!(topo.device(d1).unwrap().mac, MacAddress::from_index(2));
        assert!(topo.devices_of(NodeId(1)).is_empty());
    }

    #[test]
    fn test_point_to_point_takes_two() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(3);
        let p2p = topo.create_channel(LinkKind::PointToPoint);
        topo.attach_device(nodes[0], p2p).unwrap();
        topo.attach_device(nodes[1], p2p).unwrap();
        assert!(matches!(
            topo.attach_device(nodes[2], p2p),
            Err(TopologyError::ResourceLimit { limit: 2, .. })
        ));
    }

    #[test]
    fn test_shared_domain_limit() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(251);
        let wifi = topo.create_channel(LinkKind::Wireless);
        for node in &nodes[..250] {
            topo.attach_device(*node, wifi).unwrap();
        }
        assert!(matches!(
            topo.attach_device(nodes[250], wifi),
            Err(TopologyError::ResourceLimit { limit: 250, .. })
        ));
    }

    #[test]
    fn test_assign_in_attach_order() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(4);
        let wifi = topo.create_channel(LinkKind::Wireless);
        // Stations first, then the access point.
        for n in [1, 2, 3, 0] {
            topo.attach_device(nodes[n], wifi).unwrap();
        }
        let assigned = topo.assign(wifi, Subnet::parse("10.1.3.0", "255.255.255.0").unwrap()).unwrap();
        assert_eq!(assigned.len(), 4);
        assert_eq!(topo.address_on(nodes[1], wifi), Some(Ipv4Addr::new(10, 1, 3, 1)));
        assert_eq!(topo.address_on(nodes[0], wifi), Some(Ipv4Addr::new(10, 1, 3, 4)));
    }

    #[test]
    fn test_subnet_reuse_rejected() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(2);
        let a = topo.create_channel(LinkKind::PointToPoint);
        let b = topo.create_channel(LinkKind::PointToPoint);
        for c in [a, b] {
            topo.attach_device(nodes[0], c).unwrap();
            topo.attach_device(nodes[1], c).unwrap();
        }
        let subnet: Subnet = "10.1.1.0/24".parse().unwrap();
        topo.assign(a, subnet).unwrap();
        assert!(matches!(topo.assign(b, subnet), Err(TopologyError::Configuration(_))));
        assert!(matches!(
            topo.assign(a, "10.9.9.0/24".parse().unwrap()),
            Err(TopologyError::Configuration(_))
        ));
    }

    #[test]
    fn test_subnet_exhaustion() {
        let mut topo = Topology::new();
        let nodes = topo.create_nodes(3);
        let lan = topo.create_channel(LinkKind::Contention);
        for n in &nodes {
            topo.attach_device(*n, lan).unwrap();
        }
        // A /30 holds two hosts.
        assert!(matches!(
            topo.assign(lan, "10.1.1.0/30".parse().unwrap()),
            Err(TopologyError::ResourceLimit { limit: 2, .. })
        ));
    }
}
