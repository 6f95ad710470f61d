//! Scenario validation and simulation building.
//!
//! Building runs in two phases. [`validate`] resolves every selector, rate,
//! subnet and mobility model of a merged [`Scenario`] into a plan without
//! creating anything; [`build_simulation`] turns the plan into a topology,
//! routing tables and entities. A scenario that fails validation never
//! produces a single entity.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use nsim_apps::{AppWindow, EchoClient, EchoClientConfig, EchoServer};
use nsim_common::{ChannelId, EntityId, EntityRegistry, EventPayload, NodeId, SimTime, Vector};
use nsim_link::{
    ChannelEntity, ContentionMedium, DataRate, FixedRate, LinkKind, LinkModel, Member, PointToPointLink,
    WirelessDomain, MAX_SHARED_DOMAIN_DEVICES,
};
use nsim_mobility::{GridPositionAllocator, MobilityDriver, MobilityModel, MobilityRegistry, SharedMobility};
use nsim_net::{populate_routing, Interface, NodeStack, Subnet, Topology, TopologyError};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    AppKind, ChannelConfig, MobilityKind, ModelError, PositionAllocatorConfig, RemoteConfig, Scenario,
};

/// Default wireless data rate.
const DEFAULT_WIRELESS_RATE_MBPS: u64 = 54;

/// Default SSID of wireless channels.
const DEFAULT_SSID: &str = "ns-3-ssid";

const DEFAULT_MAX_PACKETS: u32 = 100;
const DEFAULT_PACKET_SIZE: usize = 100;

// ============================================================================
// Public Results
// ============================================================================

/// An event to schedule before the run starts.
#[derive(Debug, Clone)]
pub struct InitialEvent {
    /// Absolute time.
    pub time: SimTime,
    /// Target entities.
    pub targets: Vec<EntityId>,
    /// Payload.
    pub payload: EventPayload,
}

/// Information about a built node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Selector-style name, e.g. `sta[2]`.
    pub name: String,
    /// Node id.
    pub node: NodeId,
    /// Entity id of the node's stack.
    pub stack: EntityId,
    /// Assigned addresses in device order.
    pub addresses: Vec<Ipv4Addr>,
    /// Installed mobility model, if any.
    pub mobility: Option<&'static str>,
}

/// Information about a built channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Channel id.
    pub channel: ChannelId,
    /// Entity id of the channel.
    pub entity: EntityId,
    /// Delivery model.
    pub kind: LinkKind,
    /// Attached node names in attachment order.
    pub members: Vec<String>,
    /// Assigned subnet.
    pub subnet: Option<Subnet>,
}

/// Information about a built application.
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    /// Application name.
    pub name: String,
    /// Entity id.
    pub entity: EntityId,
    /// Host node.
    pub node: NodeId,
    /// Application kind.
    pub kind: AppKind,
    /// Local port.
    pub local_port: u16,
    /// Destination of a client.
    pub remote: Option<(Ipv4Addr, u16)>,
    /// Active period.
    pub window: AppWindow,
}

/// Result of a successful validation.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    /// Node names in id order.
    pub nodes: Vec<String>,
    /// Channels as `(name, kind, members, subnet)`.
    pub channels: Vec<(String, LinkKind, usize, Option<Subnet>)>,
    /// Application names.
    pub applications: Vec<String>,
    /// Nodes with a random-walk model.
    pub random_walkers: usize,
    /// Horizon, if the scenario sets one.
    pub stop_time: Option<SimTime>,
}

/// A simulation ready to run.
pub struct BuiltSimulation {
    /// Every entity, stacks first, then channels, the mobility driver and
    /// applications.
    pub entities: EntityRegistry,
    /// Events to schedule before the run.
    pub initial_events: Vec<InitialEvent>,
    /// Per-node information.
    pub node_infos: Vec<NodeInfo>,
    /// Per-channel information.
    pub channel_infos: Vec<ChannelInfo>,
    /// Per-application information.
    pub app_infos: Vec<AppInfo>,
    /// Topology and address plan.
    pub topology: Topology,
    /// Mobility state shared with wireless channels and the driver.
    pub mobility: SharedMobility,
    /// Horizon from the scenario.
    pub stop_time: Option<SimTime>,
    /// Seed the simulation was built for.
    pub seed: u64,
}

// ============================================================================
// Node Selectors
// ============================================================================

/// Node id ranges of every group.
struct Groups {
    ranges: Vec<(String, u32, u32)>,
}

impl Groups {
    fn new(scenario: &Scenario) -> Result<Self, ModelError> {
        let mut ranges = Vec::new();
        let mut next = 0u32;
        for group in scenario.node_groups() {
            if group.name.is_empty() || group.name.contains(|c| c == '[' || c == ']') {
                return Err(ModelError::InvalidConfig(format!(
                    "invalid node group name '{}'",
                    group.name
                )));
            }
            if group.count > MAX_SHARED_DOMAIN_DEVICES {
                return Err(TopologyError::ResourceLimit {
                    what: format!("nodes in group '{}'", group.name),
                    limit: MAX_SHARED_DOMAIN_DEVICES,
                }
                .into());
            }
            ranges.push((group.name.clone(), next, group.count as u32));
            next += group.count as u32;
        }
        Ok(Groups { ranges })
    }

    fn node_names(&self) -> Vec<String> {
        self.ranges
            .iter()
            .flat_map(|(name, _, count)| (0..*count).map(move |i| format!("{}[{}]", name, i)))
            .collect()
    }

    /// Nodes named by `selector`, in order.
    fn resolve(&self, selector: &str) -> Result<Vec<NodeId>, ModelError> {
        let (name, index) = match selector.strip_suffix(']').and_then(|s| s.split_once('[')) {
            Some((name, index)) => {
                let index: i64 = index.trim().parse().map_err(|_| {
                    ModelError::InvalidConfig(format!("invalid index in node selector '{}'", selector))
                })?;
                (name.trim(), Some(index))
            }
            None => (selector.trim(), None),
        };
        let (_, first, count) = self
            .ranges
            .iter()
            .find(|(n, _, _)| n == name)
            .ok_or_else(|| ModelError::GroupNotFound(name.to_string()))?;

        match index {
            None => Ok((*first..first + count).map(NodeId).collect()),
            Some(i) => {
                let resolved = if i < 0 { *count as i64 + i } else { i };
                if resolved < 0 || resolved >= *count as i64 {
                    return Err(ModelError::InvalidConfig(format!(
                        "node selector '{}' is out of range for a group of {}",
                        selector, count
                    )));
                }
                Ok(vec![NodeId(first + resolved as u32)])
            }
        }
    }

    /// The single node named by `selector`.
    fn resolve_one(&self, selector: &str) -> Result<NodeId, ModelError> {
        match self.resolve(selector)?.as_slice() {
            [node] => Ok(*node),
            nodes => Err(ModelError::InvalidConfig(format!(
                "node selector '{}' must name exactly one node, got {}",
                selector,
                nodes.len()
            ))),
        }
    }

    fn resolve_all(&self, selectors: &[String]) -> Result<Vec<NodeId>, ModelError> {
        let mut nodes = Vec::new();
        for selector in selectors {
            nodes.extend(self.resolve(selector)?);
        }
        Ok(nodes)
    }
}

// ============================================================================
// Plan
// ============================================================================

struct ChannelPlan {
    name: String,
    kind: LinkKind,
    rate: DataRate,
    delay: SimTime,
    members: Vec<NodeId>,
    subnet: Option<Subnet>,
    ssid: String,
    range_m: Option<f64>,
    constant_speed_propagation: bool,
}

enum RemotePlan {
    Address(Ipv4Addr),
    Interface { node: NodeId, channel: usize },
}

enum AppPlanKind {
    Server {
        port: u16,
    },
    Client {
        remote: RemotePlan,
        port: u16,
        max_packets: u32,
        interval: SimTime,
        packet_size: usize,
    },
}

struct AppPlan {
    name: String,
    node: NodeId,
    kind: AppPlanKind,
    window: AppWindow,
}

struct Plan {
    node_names: Vec<String>,
    channels: Vec<ChannelPlan>,
    mobility: MobilityRegistry,
    mobility_labels: BTreeMap<NodeId, &'static str>,
    apps: Vec<AppPlan>,
    stop_time: Option<SimTime>,
}

/// Position source with its consumption state.
enum Allocator {
    Grid { config: GridPositionAllocator, next: u32 },
    List { positions: Vec<Vector>, next: usize },
}

impl Allocator {
    fn from_config(config: &PositionAllocatorConfig) -> Result<Self, ModelError> {
        match (&config.grid, &config.list) {
            (Some(grid), None) => {
                if grid.grid_width == 0 {
                    return Err(ModelError::InvalidConfig(format!(
                        "position allocator '{}' needs a positive grid_width",
                        config.name
                    )));
                }
                Ok(Allocator::Grid {
                    config: grid.clone(),
                    next: 0,
                })
            }
            (None, Some(list)) if !list.is_empty() => Ok(Allocator::List {
                positions: list.iter().map(|p| vector(*p)).collect(),
                next: 0,
            }),
            _ => Err(ModelError::InvalidConfig(format!(
                "position allocator '{}' needs exactly one non-empty 'grid' or 'list'",
                config.name
            ))),
        }
    }

    fn next_position(&mut self) -> Vector {
        match self {
            Allocator::Grid { config, next } => {
                let position = config.position_at_index(*next);
                *next += 1;
                position
            }
            Allocator::List { positions, next } => {
                let position = positions[*next % positions.len()];
                *next += 1;
                position
            }
        }
    }
}

fn vector(p: [f64; 3]) -> Vector {
    Vector::new(p[0], p[1], p[2])
}

fn plan(scenario: &Scenario) -> Result<Plan, ModelError> {
    let groups = Groups::new(scenario)?;
    let node_names = groups.node_names();
    let stop_time = scenario
        .simulation()
        .stop_time
        .as_ref()
        .map(|q| q.to_time())
        .transpose()?;

    let channels = plan_channels(scenario, &groups)?;
    let (mobility, mobility_labels) = plan_mobility(scenario, &groups, &channels)?;
    if stop_time.is_none() && !mobility.random_walkers().is_empty() {
        return Err(ModelError::InvalidConfig(
            "random-walk mobility needs simulation.stop_time".to_string(),
        ));
    }
    let apps = plan_apps(scenario, &groups, &channels)?;

    Ok(Plan {
        node_names,
        channels,
        mobility,
        mobility_labels,
        apps,
        stop_time,
    })
}

fn parse_subnet(config: &ChannelConfig) -> Result<Option<Subnet>, ModelError> {
    let subnet = match (&config.subnet, &config.mask) {
        (None, None) => return Ok(None),
        (None, Some(_)) => {
            return Err(ModelError::InvalidConfig(format!(
                "channel '{}' has a mask but no subnet",
                config.name
            )))
        }
        (Some(base), Some(mask)) => Subnet::parse(base, mask)?,
        (Some(cidr), None) if cidr.contains('/') => cidr.parse()?,
        (Some(base), None) => {
            return Err(ModelError::InvalidConfig(format!(
                "channel '{}' subnet '{}' needs a mask or a /prefix",
                config.name, base
            )))
        }
    };
    Ok(Some(subnet))
}

fn plan_channels(scenario: &Scenario, groups: &Groups) -> Result<Vec<ChannelPlan>, ModelError> {
    let mut plans: Vec<ChannelPlan> = Vec::new();
    for config in scenario.channels() {
        let members = groups.resolve_all(&config.members)?;
        let mut seen = BTreeSet::new();
        if let Some(dup) = members.iter().find(|n| !seen.insert(**n)) {
            return Err(ModelError::InvalidConfig(format!(
                "node {} is attached to channel '{}' twice",
                dup, config.name
            )));
        }

        let limit = config.kind.capacity();
        if members.len() > limit {
            return Err(TopologyError::ResourceLimit {
                what: format!("devices on {} channel '{}'", config.kind, config.name),
                limit,
            }
            .into());
        }
        if config.kind == LinkKind::PointToPoint && members.len() != 2 {
            return Err(ModelError::InvalidConfig(format!(
                "point-to-point channel '{}' needs exactly 2 members, got {}",
                config.name,
                members.len()
            )));
        }

        let wireless = config.kind == LinkKind::Wireless;
        if !wireless && (config.ssid.is_some() || config.range_m.is_some() || config.constant_speed_propagation) {
            return Err(ModelError::InvalidConfig(format!(
                "channel '{}': ssid, range_m and constant_speed_propagation apply to wireless channels only",
                config.name
            )));
        }
        let (rate, delay) = if wireless {
            if config.delay.is_some() {
                return Err(ModelError::InvalidConfig(format!(
                    "wireless channel '{}' derives its delay from positions; remove 'delay'",
                    config.name
                )));
            }
            let rate = match &config.data_rate {
                Some(q) => q.to_rate()?,
                None => DataRate::from_mbps(DEFAULT_WIRELESS_RATE_MBPS),
            };
            (rate, SimTime::ZERO)
        } else {
            let rate = config.data_rate.as_ref().ok_or_else(|| {
                ModelError::InvalidConfig(format!("channel '{}' needs a data_rate", config.name))
            })?;
            let delay = config
                .delay
                .as_ref()
                .ok_or_else(|| ModelError::InvalidConfig(format!("channel '{}' needs a delay", config.name)))?;
            (rate.to_rate()?, delay.to_time()?)
        };
        if let Some(range) = config.range_m {
            if !range.is_finite() || range <= 0.0 {
                return Err(ModelError::InvalidConfig(format!(
                    "channel '{}' range_m must be positive",
                    config.name
                )));
            }
        }

        let subnet = parse_subnet(config)?;
        if let Some(subnet) = subnet {
            if let Some(clash) = plans
                .iter()
                .find(|p| p.subnet.map_or(false, |s| s.overlaps(&subnet)))
            {
                return Err(TopologyError::Configuration(format!(
                    "subnet {} of channel '{}' overlaps channel '{}'",
                    subnet, config.name, clash.name
                ))
                .into());
            }
            if members.len() as u64 > subnet.host_capacity() {
                return Err(TopologyError::ResourceLimit {
                    what: format!("host addresses in {}", subnet),
                    limit: subnet.host_capacity() as usize,
                }
                .into());
            }
        }

        plans.push(ChannelPlan {
            name: config.name.clone(),
            kind: config.kind,
            rate,
            delay,
            members,
            subnet,
            ssid: config.ssid.clone().unwrap_or_else(|| DEFAULT_SSID.to_string()),
            range_m: config.range_m,
            constant_speed_propagation: config.constant_speed_propagation,
        });
    }
    Ok(plans)
}

type MobilityPlan = (MobilityRegistry, BTreeMap<NodeId, &'static str>);

fn plan_mobility(scenario: &Scenario, groups: &Groups, channels: &[ChannelPlan]) -> Result<MobilityPlan, ModelError> {
    let mut allocators = BTreeMap::new();
    for config in scenario.position_allocators() {
        allocators.insert(config.name.as_str(), Allocator::from_config(config)?);
    }

    let mut models: BTreeMap<NodeId, MobilityModel> = BTreeMap::new();
    for entry in scenario.mobility() {
        let nodes = groups.resolve_all(&entry.nodes)?;
        if let Some(positions) = &entry.positions {
            if positions.len() != nodes.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "mobility entry for {:?} lists {} positions for {} nodes",
                    entry.nodes,
                    positions.len(),
                    nodes.len()
                )));
            }
        }
        if entry.positions.is_some() && entry.allocator.is_some() {
            return Err(ModelError::InvalidConfig(format!(
                "mobility entry for {:?} sets both 'positions' and 'allocator'",
                entry.nodes
            )));
        }
        match entry.model {
            MobilityKind::ConstantVelocity if entry.velocity.is_none() => {
                return Err(ModelError::InvalidConfig(format!(
                    "constant_velocity entry for {:?} needs a velocity",
                    entry.nodes
                )))
            }
            MobilityKind::ConstantVelocity => {}
            _ if entry.velocity.is_some() => {
                return Err(ModelError::InvalidConfig(format!(
                    "velocity applies to constant_velocity entries only ({:?})",
                    entry.nodes
                )))
            }
            _ => {}
        }
        if entry.random_walk.is_some() && entry.model != MobilityKind::RandomWalk {
            return Err(ModelError::InvalidConfig(format!(
                "random_walk parameters apply to random_walk entries only ({:?})",
                entry.nodes
            )));
        }

        for (i, node) in nodes.iter().enumerate() {
            let position = match (&entry.positions, &entry.allocator) {
                (Some(positions), _) => vector(positions[i]),
                (None, Some(name)) => allocators
                    .get_mut(name.as_str())
                    .ok_or_else(|| ModelError::AllocatorNotFound(name.clone()))?
                    .next_position(),
                (None, None) => Vector::ZERO,
            };
            let model = match entry.model {
                MobilityKind::ConstantPosition => MobilityModel::ConstantPosition { position },
                MobilityKind::ConstantVelocity => MobilityModel::ConstantVelocity {
                    origin: position,
                    velocity: entry.velocity.map(vector).unwrap_or(Vector::ZERO),
                },
                MobilityKind::RandomWalk => MobilityModel::BoundedRandomWalk {
                    start: position,
                    params: entry.random_walk.unwrap_or_default(),
                },
            };
            models.insert(*node, model);
        }
    }

    // Wireless reachability needs a position for every member.
    for channel in channels.iter().filter(|c| c.kind == LinkKind::Wireless) {
        for node in &channel.members {
            models.entry(*node).or_insert(MobilityModel::ConstantPosition {
                position: Vector::ZERO,
            });
        }
    }

    let mut registry = MobilityRegistry::new();
    let mut labels = BTreeMap::new();
    for (node, model) in models {
        labels.insert(node, model.label());
        registry.install(node, model, SimTime::ZERO)?;
    }
    Ok((registry, labels))
}

fn plan_apps(scenario: &Scenario, groups: &Groups, channels: &[ChannelPlan]) -> Result<Vec<AppPlan>, ModelError> {
    let addressed: BTreeSet<NodeId> = channels
        .iter()
        .filter(|c| c.subnet.is_some())
        .flat_map(|c| c.members.iter().copied())
        .collect();
    let mut bound_ports: BTreeSet<(NodeId, u16)> = BTreeSet::new();
    let mut apps = Vec::new();

    for config in scenario.applications() {
        let node = groups.resolve_one(&config.node)?;
        if !addressed.contains(&node) {
            return Err(ModelError::InvalidConfig(format!(
                "application '{}' runs on {} which has no IPv4 address",
                config.name, config.node
            )));
        }
        let start = config.start.to_time()?;
        let stop = config.stop.to_time()?;
        if stop < start {
            return Err(ModelError::InvalidConfig(format!(
                "application '{}' stops ({}) before it starts ({})",
                config.name, stop, start
            )));
        }
        let port = config
            .port
            .ok_or_else(|| ModelError::InvalidConfig(format!("application '{}' needs a port", config.name)))?;

        let kind = match config.kind {
            AppKind::EchoServer => {
                if config.remote.is_some()
                    || config.max_packets.is_some()
                    || config.interval.is_some()
                    || config.packet_size.is_some()
                {
                    return Err(ModelError::InvalidConfig(format!(
                        "echo server '{}' takes only node, port, start and stop",
                        config.name
                    )));
                }
                if !bound_ports.insert((node, port)) {
                    return Err(TopologyError::Configuration(format!(
                        "port {} on {} is bound twice",
                        port, config.node
                    ))
                    .into());
                }
                AppPlanKind::Server { port }
            }
            AppKind::EchoClient => {
                let remote = match &config.remote {
                    None => {
                        return Err(ModelError::InvalidConfig(format!(
                            "echo client '{}' needs a remote",
                            config.name
                        )))
                    }
                    Some(RemoteConfig::Address(addr)) => RemotePlan::Address(*addr),
                    Some(RemoteConfig::Interface { node: target, channel }) => {
                        let target_node = groups.resolve_one(target)?;
                        let index = channels
                            .iter()
                            .position(|c| &c.name == channel)
                            .ok_or_else(|| ModelError::ChannelNotFound(channel.clone()))?;
                        let plan = &channels[index];
                        if plan.subnet.is_none() || !plan.members.contains(&target_node) {
                            return Err(ModelError::InvalidConfig(format!(
                                "echo client '{}': {} has no address on channel '{}'",
                                config.name, target, channel
                            )));
                        }
                        RemotePlan::Interface {
                            node: target_node,
                            channel: index,
                        }
                    }
                };
                let interval = match &config.interval {
                    Some(q) => q.to_time()?,
                    None => SimTime::from_secs(1.0),
                };
                if interval == SimTime::ZERO {
                    return Err(ModelError::InvalidConfig(format!(
                        "echo client '{}' needs a positive interval",
                        config.name
                    )));
                }
                let packet_size = config.packet_size.unwrap_or(DEFAULT_PACKET_SIZE);
                if packet_size < nsim_apps::SEQ_BYTES {
                    return Err(ModelError::InvalidConfig(format!(
                        "echo client '{}' packet_size must be at least {} bytes",
                        config.name,
                        nsim_apps::SEQ_BYTES
                    )));
                }
                AppPlanKind::Client {
                    remote,
                    port,
                    max_packets: config.max_packets.unwrap_or(DEFAULT_MAX_PACKETS),
                    interval,
                    packet_size,
                }
            }
        };

        apps.push(AppPlan {
            name: config.name.clone(),
            node,
            kind,
            window: AppWindow::new(start, stop),
        });
    }
    Ok(apps)
}

/// Check a scenario without building it.
pub fn validate(scenario: &Scenario) -> Result<ScenarioSummary, ModelError> {
    let plan = plan(scenario)?;
    Ok(ScenarioSummary {
        random_walkers: plan.mobility.random_walkers().len(),
        channels: plan
            .channels
            .iter()
            .map(|c| (c.name.clone(), c.kind, c.members.len(), c.subnet))
            .collect(),
        applications: plan.apps.iter().map(|a| a.name.clone()).collect(),
        nodes: plan.node_names,
        stop_time: plan.stop_time,
    })
}

// ============================================================================
// Building
// ============================================================================

/// Build a runnable simulation from a scenario.
///
/// Entity ids are assigned in a fixed order: one stack per node (entity id
/// equals node id), then one entity per channel, then the mobility driver
/// when random walkers exist, then the applications.
pub fn build_simulation(scenario: &Scenario, seed: u64) -> Result<BuiltSimulation, ModelError> {
    let plan = plan(scenario)?;
    let mut next_entity_id: u64 = 0;
    let mut alloc_id = || {
        let id = EntityId::new(next_entity_id);
        next_entity_id += 1;
        id
    };

    // Topology and addresses.
    let mut topology = Topology::new();
    let nodes = topology.create_nodes(plan.node_names.len());
    let mut channel_ids = Vec::with_capacity(plan.channels.len());
    for channel in &plan.channels {
        let id = topology.create_channel(channel.kind);
        for node in &channel.members {
            topology.attach_device(*node, id)?;
        }
        if let Some(subnet) = channel.subnet {
            let assigned = topology.assign(id, subnet)?;
            debug!(channel = %channel.name, %subnet, hosts = assigned.len(), "assigned addresses");
        }
        channel_ids.push(id);
    }
    let mut tables = populate_routing(&topology);

    let stack_ids: Vec<EntityId> = nodes.iter().map(|_| alloc_id()).collect();
    let channel_entity_ids: Vec<EntityId> = channel_ids.iter().map(|_| alloc_id()).collect();

    let mobility = plan.mobility.shared();
    let walkers = mobility.read().random_walkers();
    let driver_id = if walkers.is_empty() { None } else { Some(alloc_id()) };

    // Stacks.
    let mut stacks: Vec<NodeStack> = nodes
        .iter()
        .zip(&stack_ids)
        .map(|(node, id)| NodeStack::new(*id, *node, tables.remove(node).unwrap_or_default()))
        .collect();
    for record in topology.devices() {
        stacks[record.node.index()].add_interface(Interface {
            device: record.id,
            mac: record.mac,
            address: record.address,
            channel: channel_entity_ids[record.channel.index()],
        });
    }

    // Channels.
    let mut entities = EntityRegistry::new();
    let mut channel_infos = Vec::with_capacity(plan.channels.len());
    for ((channel, id), entity_id) in plan.channels.iter().zip(&channel_ids).zip(&channel_entity_ids) {
        let link: Box<dyn LinkModel> = match channel.kind {
            LinkKind::PointToPoint => Box::new(PointToPointLink::new(channel.rate, channel.delay)),
            LinkKind::Contention => Box::new(ContentionMedium::new(channel.rate, channel.delay)),
            LinkKind::Wireless => {
                let mut domain = WirelessDomain::new(channel.ssid.clone(), mobility.clone())
                    .with_constant_speed_propagation(channel.constant_speed_propagation)
                    .with_rate_control(Box::new(FixedRate(channel.rate)));
                if let Some(range) = channel.range_m {
                    domain = domain.with_range(range);
                }
                Box::new(domain)
            }
        };
        let mut entity = ChannelEntity::new(*entity_id, *id, link);
        let record = topology
            .channel(*id)
            .ok_or_else(|| TopologyError::Configuration(format!("unknown channel {}", id)))?;
        for device in &record.devices {
            let device = topology
                .device(*device)
                .ok_or_else(|| TopologyError::Configuration(format!("unknown device {}", device)))?;
            entity.attach(
                Member {
                    device: device.id,
                    node: device.node,
                    mac: device.mac,
                },
                stack_ids[device.node.index()],
            )?;
        }
        entities.register(Box::new(entity));
        channel_infos.push(ChannelInfo {
            name: channel.name.clone(),
            channel: *id,
            entity: *entity_id,
            kind: channel.kind,
            members: channel
                .members
                .iter()
                .map(|n| plan.node_names[n.index()].clone())
                .collect(),
            subnet: channel.subnet,
        });
    }

    let mut initial_events = Vec::new();

    // Mobility driver.
    if let Some(id) = driver_id {
        let driver = MobilityDriver::new(id, mobility.clone());
        for (time, payload) in driver.initial_timers(SimTime::ZERO) {
            initial_events.push(InitialEvent {
                time,
                targets: vec![id],
                payload,
            });
        }
        entities.register(Box::new(driver));
    }

    // Applications.
    let mut app_infos = Vec::with_capacity(plan.apps.len());
    for app in &plan.apps {
        let id = alloc_id();
        let stack = &mut stacks[app.node.index()];
        let (timers, info) = match &app.kind {
            AppPlanKind::Server { port } => {
                stack.bind(*port, id)?;
                let server = EchoServer::new(id, app.node, stack_ids[app.node.index()], *port, app.window);
                let timers = server.initial_timers();
                entities.register(Box::new(server));
                (timers, (*port, None))
            }
            AppPlanKind::Client {
                remote,
                port,
                max_packets,
                interval,
                packet_size,
            } => {
                let remote = match remote {
                    RemotePlan::Address(addr) => *addr,
                    RemotePlan::Interface { node, channel } => topology
                        .address_on(*node, channel_ids[*channel])
                        .ok_or_else(|| {
                            ModelError::InvalidConfig(format!("application '{}' remote has no address", app.name))
                        })?,
                };
                let local_port = stack.bind_ephemeral(id)?;
                let client = EchoClient::new(
                    id,
                    app.node,
                    stack_ids[app.node.index()],
                    local_port,
                    EchoClientConfig {
                        remote,
                        port: *port,
                        max_packets: *max_packets,
                        interval: *interval,
                        packet_size: *packet_size,
                        window: app.window,
                    },
                );
                let timers = client.initial_timers();
                entities.register(Box::new(client));
                (timers, (local_port, Some((remote, *port))))
            }
        };
        for (time, payload) in timers {
            initial_events.push(InitialEvent {
                time,
                targets: vec![id],
                payload,
            });
        }
        app_infos.push(AppInfo {
            name: app.name.clone(),
            entity: id,
            node: app.node,
            kind: match app.kind {
                AppPlanKind::Server { .. } => AppKind::EchoServer,
                AppPlanKind::Client { .. } => AppKind::EchoClient,
            },
            local_port: info.0,
            remote: info.1,
            window: app.window,
        });
    }

    let node_infos: Vec<NodeInfo> = nodes
        .iter()
        .map(|node| NodeInfo {
            name: plan.node_names[node.index()].clone(),
            node: *node,
            stack: stack_ids[node.index()],
            addresses: topology.addresses_of(*node),
            mobility: plan.mobility_labels.get(node).copied(),
        })
        .collect();

    for stack in stacks {
        entities.register(Box::new(stack));
    }

    info!(
        nodes = node_infos.len(),
        channels = channel_infos.len(),
        applications = app_infos.len(),
        random_walkers = walkers.len(),
        "built simulation"
    );

    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        channel_infos,
        app_infos,
        topology,
        mobility,
        stop_time: plan.stop_time,
        seed,
    })
}
