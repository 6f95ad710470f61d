//! Per-node protocol stack entity.
//!
//! Sits between a node's applications and its devices:
//!
//! - `SendDatagram` from an application is routed out of the matching
//!   interface (or delivered locally when addressed to the node itself).
//! - `FrameArrival` from a channel is delivered to the bound port, or
//!   forwarded towards its destination with the TTL decremented.
//!
//! Everything the stack posts is immediate, so delivery is always a later
//! event than the call that caused it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use nsim_common::{
    Datagram, DatagramReceivedEvent, DeliveryAnomaly, DeviceId, Entity, EntityId, Event, EventPayload,
    Frame, FrameId, MacAddress, NodeId, SimContext, SimError, TraceKind, TransmitEvent,
};
use tracing::{debug, trace};

use crate::{RoutingTable, TopologyError};

/// First port handed out by [`NodeStack::bind_ephemeral`].
pub const EPHEMERAL_PORT_START: u16 = 49153;

/// One attached device as seen by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    /// Device id.
    pub device: DeviceId,
    /// Device MAC.
    pub mac: MacAddress,
    /// Assigned address, if the channel has a subnet.
    pub address: Option<Ipv4Addr>,
    /// Channel entity carrying the device's frames.
    pub channel: EntityId,
}

/// Protocol stack of one node.
pub struct NodeStack {
    id: EntityId,
    node: NodeId,
    interfaces: Vec<Interface>,
    routes: RoutingTable,
    ports: BTreeMap<u16, EntityId>,
    next_ephemeral: u16,
}

impl NodeStack {
    /// Create a stack with the node's routing table and no interfaces.
    pub fn new(id: EntityId, node: NodeId, routes: RoutingTable) -> Self {
        NodeStack {
            id,
            node,
            interfaces: Vec::new(),
            routes,
            ports: BTreeMap::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    /// Add an interface.
    pub fn add_interface(&mut self, interface: Interface) {
        self.interfaces.push(interface);
    }

    /// Bind `port` to an application entity.
    pub fn bind(&mut self, port: u16, app: EntityId) -> Result<(), TopologyError> {
        if let Some(owner) = self.ports.get(&port) {
            return Err(TopologyError::Configuration(format!(
                "port {} on node {} already bound to entity {}",
                port, self.node, owner.0
            )));
        }
        self.ports.insert(port, app);
        Ok(())
    }

    /// Bind the next free ephemeral port to `app` and return it.
    pub fn bind_ephemeral(&mut self, app: EntityId) -> Result<u16, TopologyError> {
        let mut port = self.next_ephemeral;
        while self.ports.contains_key(&port) {
            port = port.checked_add(1).ok_or_else(|| TopologyError::ResourceLimit {
                what: format!("ephemeral ports on node {}", self.node),
                limit: (u16::MAX - EPHEMERAL_PORT_START) as usize + 1,
            })?;
        }
        self.ports.insert(port, app);
        self.next_ephemeral = port.saturating_add(1);
        Ok(port)
    }

    /// Node this stack belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Interfaces in creation order.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Forwarding table.
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Whether `addr` is assigned to one of this node's interfaces.
    pub fn owns(&self, addr: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.address == Some(addr))
    }

    fn interface(&self, device: DeviceId) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.device == device)
    }

    fn drop_datagram(
        &self,
        datagram: &Datagram,
        device: Option<DeviceId>,
        frame: Option<FrameId>,
        anomaly: DeliveryAnomaly,
        ctx: &mut SimContext,
    ) {
        debug!(node = %self.node, dst = %datagram.dst, %anomaly, "datagram dropped");
        ctx.emit(TraceKind::Drop {
            channel: None,
            node: self.node,
            device,
            frame,
            bytes: datagram.wire_size(),
            anomaly,
        });
    }

    fn deliver_local(&self, datagram: Datagram, device: Option<DeviceId>, ctx: &mut SimContext) {
        match self.ports.get(&datagram.dst_port) {
            Some(app) => {
                trace!(node = %self.node, port = datagram.dst_port, "deliver to application");
                ctx.post_immediate(
                    vec![*app],
                    EventPayload::DatagramReceived(DatagramReceivedEvent { datagram }),
                );
            }
            None => self.drop_datagram(&datagram, device, None, DeliveryAnomaly::PortUnreachable, ctx),
        }
    }

    /// Look up the route for the datagram and hand a frame to the channel.
    fn route_out(&self, mut datagram: Datagram, frame: Option<FrameId>, ctx: &mut SimContext) {
        let Some(route) = self.routes.lookup(datagram.dst).copied() else {
            self.drop_datagram(&datagram, None, frame, DeliveryAnomaly::NoRoute, ctx);
            return;
        };
        let Some(interface) = self.interface(route.device).copied() else {
            self.drop_datagram(&datagram, Some(route.device), frame, DeliveryAnomaly::NoRoute, ctx);
            return;
        };
        let next_hop = route.gateway.unwrap_or(datagram.dst);
        let Some(dst_mac) = self.routes.neighbor(next_hop) else {
            self.drop_datagram(&datagram, Some(route.device), frame, DeliveryAnomaly::NoRoute, ctx);
            return;
        };
        if datagram.src.is_unspecified() {
            datagram.src = interface.address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        }

        trace!(node = %self.node, dst = %datagram.dst, %next_hop, device = %interface.device, "route out");
        ctx.post_immediate(
            vec![interface.channel],
            EventPayload::Transmit(TransmitEvent {
                device: interface.device,
                frame: Frame {
                    src: interface.mac,
                    dst: dst_mac,
                    datagram,
                },
            }),
        );
    }

    fn handle_send(&self, mut datagram: Datagram, ctx: &mut SimContext) {
        if self.owns(datagram.dst) {
            if datagram.src.is_unspecified() {
                datagram.src = datagram.dst;
            }
            self.deliver_local(datagram, None, ctx);
            return;
        }
        self.route_out(datagram, None, ctx);
    }

    fn handle_frame(&self, device: DeviceId, frame_id: FrameId, frame: &Frame, ctx: &mut SimContext) {
        let Some(interface) = self.interface(device) else {
            return;
        };
        if frame.dst != interface.mac && !frame.dst.is_broadcast() {
            return;
        }

        let mut datagram = frame.datagram.clone();
        if self.owns(datagram.dst) {
            self.deliver_local(datagram, Some(device), ctx);
            return;
        }
        if frame.dst.is_broadcast() {
            return;
        }
        if datagram.ttl <= 1 {
            self.drop_datagram(&datagram, Some(device), Some(frame_id), DeliveryAnomaly::TtlExpired, ctx);
            return;
        }
        datagram.ttl -= 1;
        self.route_out(datagram, Some(frame_id), ctx);
    }
}

impl Entity for NodeStack {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::SendDatagram(send) => self.handle_send(send.datagram.clone(), ctx),
            EventPayload::FrameArrival(arrival) => {
                self.handle_frame(arrival.device, arrival.frame_id, &arrival.frame, ctx)
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{populate_routing, Topology};
    use nsim_common::{EntityRegistry, SendDatagramEvent, SimTime, TraceEvent};
    use nsim_link::{ChannelEntity, ContentionMedium, DataRate, LinkKind, LinkModel, Member, PointToPointLink};
    use std::sync::{Arc, Mutex};

    const SINK: EntityId = EntityId(1000);

    type Received = Arc<Mutex<Vec<(SimTime, Datagram)>>>;

    struct Sink {
        got: Received,
    }

    impl Entity for Sink {
        fn entity_id(&self) -> EntityId {
            SINK
        }

        fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
            if let EventPayload::DatagramReceived(rx) = &event.payload {
                self.got.lock().unwrap().push((ctx.time(), rx.datagram.clone()));
            }
            Ok(())
        }
    }

    fn channel_entity(id: nsim_common::ChannelId) -> EntityId {
        EntityId(100 + id.0 as u64)
    }

    /// n0 =p2p(5Mbps, 2ms)= n1 -lan(100Mbps, 6560ns)- n2, with a sink on
    /// n2 port 9.
    fn network() -> (EntityRegistry, Received) {
        let mut topo = Topology::new();
        let n = topo.create_nodes(3);
        let p2p = topo.create_channel(LinkKind::PointToPoint);
        let lan = topo.create_channel(LinkKind::Contention);
        topo.attach_device(n[0], p2p).unwrap();
        topo.attach_device(n[1], p2p).unwrap();
        topo.attach_device(n[1], lan).unwrap();
        topo.attach_device(n[2], lan).unwrap();
        topo.assign(p2p, "10.1.1.0/24".parse().unwrap()).unwrap();
        topo.assign(lan, "10.1.2.0/24".parse().unwrap()).unwrap();
        let tables = populate_routing(&topo);

        let mut channels: Vec<ChannelEntity> = topo
            .channels()
            .iter()
            .map(|c| {
                let link: Box<dyn LinkModel> = match c.kind {
                    LinkKind::PointToPoint => {
                        Box::new(PointToPointLink::new(DataRate::from_mbps(5), SimTime::from_millis(2)))
                    }
                    _ => Box::new(ContentionMedium::new(DataRate::from_mbps(100), SimTime::from_nanos(6560))),
                };
                ChannelEntity::new(channel_entity(c.id), c.id, link)
            })
            .collect();

        let got = Arc::new(Mutex::new(Vec::new()));
        let mut registry = EntityRegistry::new();
        for node in topo.nodes() {
            let mut stack = NodeStack::new(EntityId(node.0 as u64), node, tables[&node].clone());
            for device in topo.devices_of(node) {
                let record = topo.device(*device).unwrap();
                stack.add_interface(Interface {
                    device: record.id,
                    mac: record.mac,
                    address: record.address,
                    channel: channel_entity(record.channel),
                });
                channels[record.channel.index()]
                    .attach(
                        Member {
                            device: record.id,
                            node,
                            mac: record.mac,
                        },
                        stack.entity_id(),
                    )
                    .unwrap();
            }
            if node == n[2] {
                stack.bind(9, SINK).unwrap();
            }
            registry.register(Box::new(stack));
        }
        for channel in channels {
            registry.register(Box::new(channel));
        }
        registry.register(Box::new(Sink { got: got.clone() }));
        (registry, got)
    }

    fn run(ctx: &mut SimContext, registry: &mut EntityRegistry) -> Vec<TraceEvent> {
        let mut trace = Vec::new();
        while let Some(event) = ctx.next_event(SimTime::MAX) {
            registry.dispatch_event(&event, ctx).unwrap();
            trace.extend(ctx.take_trace());
        }
        trace
    }

    fn send(ctx: &mut SimContext, from: u64, datagram: Datagram) {
        ctx.post_immediate(
            vec![EntityId(from)],
            EventPayload::SendDatagram(SendDatagramEvent { datagram }),
        );
    }

    fn drops(trace: &[TraceEvent]) -> Vec<(NodeId, DeliveryAnomaly)> {
        trace
            .iter()
            .filter_map(|t| match t.kind {
                TraceKind::Drop { node, anomaly, .. } => Some((node, anomaly)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_forwarded_across_two_hops() {
        let (mut registry, got) = network();
        let mut ctx = SimContext::new(1);
        send(&mut ctx, 0, Datagram::new(Ipv4Addr::new(10, 1, 2, 2), 49153, 9, vec![7; 1024]));
        let trace = run(&mut ctx, &mut registry);

        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        let (at, datagram) = &got[0];
        // p2p: 1054 bytes at 5 Mbps + 2 ms; lan: 1070 bytes at 100 Mbps + 6560 ns.
        assert_eq!(*at, SimTime::from_nanos(1_686_400 + 2_000_000 + 85_600 + 6_560));
        assert_eq!(datagram.src, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(datagram.ttl, nsim_common::DEFAULT_TTL - 1);
        assert!(drops(&trace).is_empty());
    }

    #[test]
    fn test_ttl_expires_at_router() {
        let (mut registry, got) = network();
        let mut ctx = SimContext::new(1);
        let mut datagram = Datagram::new(Ipv4Addr::new(10, 1, 2, 2), 49153, 9, vec![0; 16]);
        datagram.ttl = 1;
        send(&mut ctx, 0, datagram);
        let trace = run(&mut ctx, &mut registry);
        assert!(got.lock().unwrap().is_empty());
        assert_eq!(drops(&trace), vec![(NodeId(1), DeliveryAnomaly::TtlExpired)]);
    }

    #[test]
    fn test_unroutable_destination() {
        let (mut registry, _) = network();
        let mut ctx = SimContext::new(1);
        send(&mut ctx, 2, Datagram::new(Ipv4Addr::new(192, 168, 1, 1), 49153, 9, vec![0; 16]));
        let trace = run(&mut ctx, &mut registry);
        assert_eq!(drops(&trace), vec![(NodeId(2), DeliveryAnomaly::NoRoute)]);
    }

    #[test]
    fn test_closed_port() {
        let (mut registry, got) = network();
        let mut ctx = SimContext::new(1);
        send(&mut ctx, 0, Datagram::new(Ipv4Addr::new(10, 1, 2, 2), 49153, 10, vec![0; 16]));
        let trace = run(&mut ctx, &mut registry);
        assert!(got.lock().unwrap().is_empty());
        assert_eq!(drops(&trace), vec![(NodeId(2), DeliveryAnomaly::PortUnreachable)]);
    }

    #[test]
    fn test_loopback_delivery_is_a_later_event() {
        let (mut registry, got) = network();
        let mut ctx = SimContext::new(1);
        let at = SimTime::from_secs(1.0);
        ctx.post_at(
            at,
            vec![EntityId(2)],
            EventPayload::SendDatagram(SendDatagramEvent {
                datagram: Datagram::new(Ipv4Addr::new(10, 1, 2, 2), 49153, 9, vec![1, 2, 3]),
            }),
        )
        .unwrap();
        let trace = run(&mut ctx, &mut registry);
        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, at);
        assert_eq!(got[0].1.src, Ipv4Addr::new(10, 1, 2, 2));
        assert!(!trace.iter().any(|t| matches!(t.kind, TraceKind::Transmit { .. })));
    }

    #[test]
    fn test_port_binding() {
        let mut stack = NodeStack::new(EntityId(0), NodeId(0), RoutingTable::default());
        stack.bind(9, EntityId(10)).unwrap();
        assert!(matches!(stack.bind(9, EntityId(11)), Err(TopologyError::Configuration(_))));
        assert_eq!(stack.bind_ephemeral(EntityId(12)).unwrap(), EPHEMERAL_PORT_START);
        stack.bind(EPHEMERAL_PORT_START + 1, EntityId(13)).unwrap();
        assert_eq!(stack.bind_ephemeral(EntityId(14)).unwrap(), EPHEMERAL_PORT_START + 2);
    }
}
