//! Global-knowledge routing.
//!
//! [`populate_routing`] walks the finished topology once and builds, for
//! every node, a forwarding table covering every assigned subnet plus the
//! IPv4-to-MAC bindings of its on-link neighbours. It is a full recompute;
//! a changed topology needs a fresh call.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

use nsim_common::{ChannelId, DeviceId, MacAddress, NodeId};

use crate::{Subnet, Topology};

/// One forwarding entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix.
    pub destination: Subnet,
    /// Outgoing device.
    pub device: DeviceId,
    /// Next-hop address, `None` for on-link destinations.
    pub gateway: Option<Ipv4Addr>,
    /// Hops to the destination subnet's channel (0 for on-link).
    pub metric: u32,
}

/// Forwarding state of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<Route>,
    neighbors: BTreeMap<Ipv4Addr, MacAddress>,
}

impl RoutingTable {
    /// Longest-prefix match for `dst`.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.destination.contains(dst))
            .max_by_key(|r| r.destination.prefix_len())
    }

    /// Link-layer address of an on-link neighbour.
    pub fn neighbor(&self, addr: Ipv4Addr) -> Option<MacAddress> {
        self.neighbors.get(&addr).copied()
    }

    /// All routes.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Add a route.
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Bind an on-link address to a MAC.
    pub fn add_neighbor(&mut self, addr: Ipv4Addr, mac: MacAddress) {
        self.neighbors.insert(addr, mac);
    }
}

#[derive(Debug, Clone, Copy)]
struct FirstHop {
    device: DeviceId,
    gateway: Ipv4Addr,
}

/// Compute routing tables for every node.
///
/// Shortest-hop breadth-first search over the node/channel graph. Neighbours
/// are expanded in node id order, so equal-length paths resolve to the one
/// through the lowest node ids. Channels without a subnet carry no IP
/// traffic and are not traversed.
pub fn populate_routing(topology: &Topology) -> BTreeMap<NodeId, RoutingTable> {
    let adjacency = build_adjacency(topology);
    let mut tables = BTreeMap::new();

    for source in topology.nodes() {
        let mut table = RoutingTable::default();

        for device in topology.devices_of(source) {
            let Some(record) = topology.device(*device) else { continue };
            let Some(channel) = topology.channel(record.channel) else { continue };
            for peer in &channel.devices {
                if peer == device {
                    continue;
                }
                if let Some(peer) = topology.device(*peer) {
                    if let Some(addr) = peer.address {
                        table.add_neighbor(addr, peer.mac);
                    }
                }
            }
        }

        let (dist, first_hop) = bfs(source, &adjacency);

        for channel in topology.channels() {
            let Some(subnet) = channel.subnet else { continue };
            let local = topology
                .devices_of(source)
                .iter()
                .find(|d| topology.device(**d).map(|r| r.channel) == Some(channel.id));
            if let Some(device) = local {
                table.add_route(Route {
                    destination: subnet,
                    device: *device,
                    gateway: None,
                    metric: 0,
                });
                continue;
            }

            // Nearest node on the destination channel.
            let best = channel
                .devices
                .iter()
                .filter_map(|d| topology.device(*d))
                .filter_map(|r| dist.get(&r.node).map(|h| (*h, r.node)))
                .min();
            if let Some((hops, node)) = best {
                if let Some(hop) = first_hop.get(&node) {
                    table.add_route(Route {
                        destination: subnet,
                        device: hop.device,
                        gateway: Some(hop.gateway),
                        metric: hops,
                    });
                }
            }
        }

        tracing::debug!(node = %source, routes = table.routes.len(), "routing table built");
        tables.insert(source, table);
    }
    tables
}

/// `node -> [(neighbour, own device, neighbour address)]`, sorted by
/// neighbour id then device id.
type Adjacency = BTreeMap<NodeId, Vec<(NodeId, DeviceId, Ipv4Addr)>>;

fn build_adjacency(topology: &Topology) -> Adjacency {
    let mut adjacency: Adjacency = BTreeMap::new();
    for node in topology.nodes() {
        let mut edges = Vec::new();
        for device in topology.devices_of(node) {
            let Some(record) = topology.device(*device) else { continue };
            let Some(channel) = topology.channel(record.channel) else { continue };
            if channel.subnet.is_none() || record.address.is_none() {
                continue;
            }
            for peer in channel.devices.iter().filter_map(|d| topology.device(*d)) {
                if peer.node == node {
                    continue;
                }
                if let Some(addr) = peer.address {
                    edges.push((peer.node, *device, addr));
                }
            }
        }
        edges.sort_by_key(|(peer, device, _)| (*peer, *device));
        adjacency.insert(node, edges);
    }
    adjacency
}

fn bfs(source: NodeId, adjacency: &Adjacency) -> (BTreeMap<NodeId, u32>, BTreeMap<NodeId, FirstHop>) {
    let mut dist = BTreeMap::new();
    let mut first_hop: BTreeMap<NodeId, FirstHop> = BTreeMap::new();
    let mut queue = VecDeque::new();
    dist.insert(source, 0u32);
    queue.push_back(source);

    while let Some(node) = queue.pop_front() {
        let d = dist[&node];
        for (peer, device, addr) in adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if dist.contains_key(peer) {
                continue;
            }
            dist.insert(*peer, d + 1);
            let hop = if node == source {
                FirstHop {
                    device: *device,
                    gateway: *addr,
                }
            } else {
                first_hop[&node]
            };
            first_hop.insert(*peer, hop);
            queue.push_back(*peer);
        }
    }
    (dist, first_hop)
}

/// Channel a node uses to reach `dst`, for diagnostics.
pub fn egress_channel(topology: &Topology, table: &RoutingTable, dst: Ipv4Addr) -> Option<ChannelId> {
    table
        .lookup(dst)
        .and_then(|r| topology.device(r.device))
        .map(|d| d.channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsim_link::LinkKind;

    /// n1 -lan1- n0 =p2p= n2 -lan2- n3, n4
    fn two_lans() -> (Topology, Vec<NodeId>, [ChannelId; 3]) {
        let mut topo = Topology::new();
        let n = topo.create_nodes(5);
        let p2p = topo.create_channel(LinkKind::PointToPoint);
        let lan1 = topo.create_channel(LinkKind::Contention);
        let lan2 = topo.create_channel(LinkKind::Contention);
        topo.attach_device(n[0], p2p).unwrap();
        topo.attach_device(n[2], p2p).unwrap();
        topo.attach_device(n[0], lan1).unwrap();
        topo.attach_device(n[1], lan1).unwrap();
        topo.attach_device(n[2], lan2).unwrap();
        topo.attach_device(n[3], lan2).unwrap();
        topo.attach_device(n[4], lan2).unwrap();
        topo.assign(p2p, "10.1.1.0/24".parse().unwrap()).unwrap();
        topo.assign(lan1, "10.1.2.0/24".parse().unwrap()).unwrap();
        topo.assign(lan2, "10.1.3.0/24".parse().unwrap()).unwrap();
        (topo, n, [p2p, lan1, lan2])
    }

    #[test]
    fn test_connected_and_gateway_routes() {
        let (topo, n, [p2p, lan1, lan2]) = two_lans();
        let tables = populate_routing(&topo);

        let t1 = &tables[&n[1]];
        let r = t1.lookup(Ipv4Addr::new(10, 1, 3, 2)).unwrap();
        assert_eq!(r.gateway, Some(Ipv4Addr::new(10, 1, 2, 1)));
        assert_eq!(r.metric, 2);
        assert_eq!(egress_channel(&topo, t1, Ipv4Addr::new(10, 1, 3, 2)), Some(lan1));
        assert_eq!(t1.neighbor(Ipv4Addr::new(10, 1, 2, 1)), Some(topo.device(DeviceId(2)).unwrap().mac));

        let t0 = &tables[&n[0]];
        let direct = t0.lookup(Ipv4Addr::new(10, 1, 2, 2)).unwrap();
        assert_eq!(direct.gateway, None);
        let via = t0.lookup(Ipv4Addr::new(10, 1, 3, 3)).unwrap();
        assert_eq!(via.gateway, Some(Ipv4Addr::new(10, 1, 1, 2)));
        assert_eq!(egress_channel(&topo, t0, Ipv4Addr::new(10, 1, 3, 3)), Some(p2p));

        let t4 = &tables[&n[4]];
        assert_eq!(egress_channel(&topo, t4, Ipv4Addr::new(10, 1, 2, 2)), Some(lan2));
        assert!(t4.lookup(Ipv4Addr::new(192, 168, 0, 1)).is_none());
    }

    #[test]
    fn test_unaddressed_channels_are_not_traversed() {
        let mut topo = Topology::new();
        let n = topo.create_nodes(3);
        let a = topo.create_channel(LinkKind::PointToPoint);
        let b = topo.create_channel(LinkKind::PointToPoint);
        topo.attach_device(n[0], a).unwrap();
        topo.attach_device(n[1], a).unwrap();
        topo.attach_device(n[1], b).unwrap();
        topo.attach_device(n[2], b).unwrap();
        topo.assign(b, "10.0.0.0/24".parse().unwrap()).unwrap();
        let tables = populate_routing(&topo);
        assert!(tables[&n[0]].lookup(Ipv4Addr::new(10, 0, 0, 2)).is_none());
        assert!(tables[&n[1]].lookup(Ipv4Addr::new(10, 0, 0, 2)).is_some());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = RoutingTable::default();
        table.add_route(Route {
            destination: "10.0.0.0/8".parse().unwrap(),
            device: DeviceId(0),
            gateway: None,
            metric: 0,
        });
        table.add_route(Route {
            destination: "10.1.0.0/16".parse().unwrap(),
            device: DeviceId(1),
            gateway: None,
            metric: 0,
        });
        assert_eq!(table.lookup(Ipv4Addr::new(10, 1, 2, 3)).unwrap().device, DeviceId(1));
        assert_eq!(table.lookup(Ipv4Addr::new(10, 2, 2, 3)).unwrap().device, DeviceId(0));
    }
}
