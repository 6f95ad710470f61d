//! # nsim-model
//!
//! YAML scenario loading and simulation building.
//!
//! This crate provides:
//! - YAML schema types for scenarios (node groups, channels, mobility,
//!   applications)
//! - Scenario loading from files and strings, with multi-file merging
//! - Validation of a merged scenario before anything is built
//! - Simulation building: topology, routing and every entity, wired up
//!
//! ## Node selectors
//!
//! Channels, mobility entries and applications refer to nodes by selector:
//! `sta` (every node of group `sta`), `sta[2]` (third node) or `sta[-1]`
//! (last node). Negative indices keep scenarios valid when a group is
//! resized with [`Scenario::set_group_size`].

pub mod build;

pub use build::{
    build_simulation, validate, AppInfo, BuiltSimulation, ChannelInfo, InitialEvent, NodeInfo,
    ScenarioSummary,
};

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use nsim_common::SimTime;
use nsim_link::{parse_delay, DataRate, LinkError, LinkKind};
use nsim_mobility::{GridPositionAllocator, MobilityError, RandomWalkParams};
use nsim_net::TopologyError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading, validating or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reference to an undefined node group.
    #[error("Node group not found: {0}")]
    GroupNotFound(String),

    /// Reference to an undefined channel.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Reference to an undefined position allocator.
    #[error("Position allocator not found: {0}")]
    AllocatorNotFound(String),

    /// Removal of something that was never defined.
    #[error("Cannot remove undefined {kind} '{name}'")]
    RemoveUndefined {
        /// Section of the item.
        kind: &'static str,
        /// Item name.
        name: String,
    },

    /// Topology, addressing or capacity error.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Link parameter error.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Mobility parameter error.
    #[error(transparent)]
    Mobility(#[from] MobilityError),
}

impl ModelError {
    /// Whether the error is a capacity limit rather than a malformed value.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, ModelError::Topology(TopologyError::ResourceLimit { .. }))
    }
}

// ============================================================================
// YAML Schema Types
// ============================================================================

/// A time or rate given either as a bare number or as a string with units.
///
/// Bare numbers are seconds for times and bits per second for rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    /// Plain number.
    Number(f64),
    /// Number with a unit suffix, e.g. `2ms` or `5Mbps`.
    Text(String),
}

impl Quantity {
    /// Interpret as a duration.
    pub fn to_time(&self) -> Result<SimTime, ModelError> {
        match self {
            Quantity::Number(secs) if secs.is_finite() && *secs >= 0.0 => Ok(SimTime::from_secs(*secs)),
            Quantity::Number(secs) => Err(LinkError::InvalidDelay(secs.to_string()).into()),
            Quantity::Text(text) => Ok(parse_delay(text)?),
        }
    }

    /// Interpret as a data rate.
    pub fn to_rate(&self) -> Result<DataRate, ModelError> {
        match self {
            Quantity::Number(bps) if bps.is_finite() && *bps >= 1.0 => Ok(DataRate::from_bps(bps.round() as u64)?),
            Quantity::Number(bps) => Err(LinkError::InvalidRate(bps.to_string()).into()),
            Quantity::Text(text) => Ok(text.parse()?),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{}", n),
            Quantity::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Simulation-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Horizon after which no event runs.
    #[serde(default)]
    pub stop_time: Option<Quantity>,
    /// Random seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// A named group of identical nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeGroupConfig {
    /// Group name (must be unique).
    pub name: String,
    /// Number of nodes.
    #[serde(default)]
    pub count: usize,
    /// When true, the group is removed during merging.
    #[serde(default)]
    pub remove: bool,
}

/// Named source of initial positions, shared by every mobility entry that
/// references it. Exactly one of `grid` and `list` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionAllocatorConfig {
    /// Allocator name (must be unique).
    pub name: String,
    /// Regular grid.
    #[serde(default)]
    pub grid: Option<GridPositionAllocator>,
    /// Explicit positions, reused from the start when exhausted.
    #[serde(default)]
    pub list: Option<Vec<[f64; 3]>>,
    /// When true, the allocator is removed during merging.
    #[serde(default)]
    pub remove: bool,
}

/// Motion model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityKind {
    /// Fixed position.
    ConstantPosition,
    /// Straight-line motion.
    ConstantVelocity,
    /// Bounded random walk.
    RandomWalk,
}

/// Installs one motion model on a set of nodes.
///
/// Entries apply in order; a later entry replaces an earlier one for the
/// same node. Initial positions come from `positions`, else from the named
/// `allocator`, else the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MobilityConfig {
    /// Node selectors.
    pub nodes: Vec<String>,
    /// Motion model.
    pub model: MobilityKind,
    /// Velocity for `constant_velocity`.
    #[serde(default)]
    pub velocity: Option<[f64; 3]>,
    /// Walk parameters for `random_walk`.
    #[serde(default)]
    pub random_walk: Option<RandomWalkParams>,
    /// Named position allocator.
    #[serde(default)]
    pub allocator: Option<String>,
    /// Explicit initial positions, one per selected node.
    #[serde(default)]
    pub positions: Option<Vec<[f64; 3]>>,
}

/// A channel and the nodes attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Channel name (must be unique).
    pub name: String,
    /// Delivery model.
    pub kind: LinkKind,
    /// Data rate. Required for wired kinds; wireless defaults to 54 Mbps.
    #[serde(default)]
    pub data_rate: Option<Quantity>,
    /// Propagation delay (wired kinds only).
    #[serde(default)]
    pub delay: Option<Quantity>,
    /// Node selectors in attachment order.
    #[serde(default)]
    pub members: Vec<String>,
    /// Subnet base (`10.1.1.0`) or CIDR (`10.1.1.0/24`).
    #[serde(default)]
    pub subnet: Option<String>,
    /// Subnet mask, when `subnet` is a bare base address.
    #[serde(default)]
    pub mask: Option<String>,
    /// Network name (wireless only).
    #[serde(default)]
    pub ssid: Option<String>,
    /// Reachability threshold in metres (wireless only).
    #[serde(default)]
    pub range_m: Option<f64>,
    /// Add distance-proportional propagation delay (wireless only).
    #[serde(default)]
    pub constant_speed_propagation: bool,
    /// When true, the channel is removed during merging.
    #[serde(default)]
    pub remove: bool,
}

/// Application selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// UDP echo server.
    EchoServer,
    /// UDP echo client.
    EchoClient,
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppKind::EchoServer => write!(f, "echo_server"),
            AppKind::EchoClient => write!(f, "echo_client"),
        }
    }
}

/// Where an echo client sends to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteConfig {
    /// Literal address.
    Address(Ipv4Addr),
    /// Address of a node's interface on a channel.
    Interface {
        /// Node selector naming one node.
        node: String,
        /// Channel name.
        channel: String,
    },
}

/// One application instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Application name (must be unique).
    pub name: String,
    /// Application kind.
    pub kind: AppKind,
    /// Node selector naming the host node.
    pub node: String,
    /// Listening port (server) or destination port (client).
    #[serde(default)]
    pub port: Option<u16>,
    /// Destination (client only).
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    /// Datagrams to send, 0 for unbounded (client only, default 100).
    #[serde(default)]
    pub max_packets: Option<u32>,
    /// Spacing between sends (client only, default 1s).
    #[serde(default)]
    pub interval: Option<Quantity>,
    /// Payload bytes (client only, default 100).
    #[serde(default)]
    pub packet_size: Option<usize>,
    /// Start time.
    pub start: Quantity,
    /// Stop time.
    pub stop: Quantity,
    /// When true, the application is removed during merging.
    #[serde(default)]
    pub remove: bool,
}

/// Root of one scenario file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioYaml {
    #[serde(default)]
    simulation: Option<SimulationConfig>,
    #[serde(default)]
    node_groups: Vec<NodeGroupConfig>,
    #[serde(default)]
    position_allocators: Vec<PositionAllocatorConfig>,
    #[serde(default)]
    mobility: Vec<MobilityConfig>,
    #[serde(default)]
    channels: Vec<ChannelConfig>,
    #[serde(default)]
    applications: Vec<AppConfig>,
}

// ============================================================================
// Merged Scenario
// ============================================================================

/// A scenario merged from one or more files.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    simulation: SimulationConfig,
    node_groups: Vec<NodeGroupConfig>,
    position_allocators: Vec<PositionAllocatorConfig>,
    mobility: Vec<MobilityConfig>,
    channels: Vec<ChannelConfig>,
    applications: Vec<AppConfig>,
}

impl Scenario {
    /// Simulation-wide settings.
    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// Node groups in declaration order.
    pub fn node_groups(&self) -> &[NodeGroupConfig] {
        &self.node_groups
    }

    /// Position allocators.
    pub fn position_allocators(&self) -> &[PositionAllocatorConfig] {
        &self.position_allocators
    }

    /// Mobility entries in application order.
    pub fn mobility(&self) -> &[MobilityConfig] {
        &self.mobility
    }

    /// Channels in declaration order.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Applications in declaration order.
    pub fn applications(&self) -> &[AppConfig] {
        &self.applications
    }

    /// Seed from the scenario, if any.
    pub fn seed(&self) -> Option<u64> {
        self.simulation.seed
    }

    /// Override the stop time.
    pub fn set_stop_time(&mut self, stop_time: SimTime) {
        self.simulation.stop_time = Some(Quantity::Number(stop_time.as_secs_f64()));
    }

    /// Resize a node group.
    pub fn set_group_size(&mut self, name: &str, count: usize) -> Result<(), ModelError> {
        let group = self
            .node_groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| ModelError::GroupNotFound(name.to_string()))?;
        group.count = count;
        Ok(())
    }

    fn merge(&mut self, yaml: ScenarioYaml) -> Result<(), ModelError> {
        if let Some(sim) = yaml.simulation {
            if sim.stop_time.is_some() {
                self.simulation.stop_time = sim.stop_time;
            }
            if sim.seed.is_some() {
                self.simulation.seed = sim.seed;
            }
        }
        merge_named(&mut self.node_groups, yaml.node_groups, "node group", |g| (&g.name, g.remove))?;
        merge_named(
            &mut self.position_allocators,
            yaml.position_allocators,
            "position allocator",
            |a| (&a.name, a.remove),
        )?;
        merge_named(&mut self.channels, yaml.channels, "channel", |c| (&c.name, c.remove))?;
        merge_named(&mut self.applications, yaml.applications, "application", |a| (&a.name, a.remove))?;
        self.mobility.extend(yaml.mobility);
        Ok(())
    }
}

/// Merge named items: same name replaces in place, `remove` deletes, new
/// names append.
fn merge_named<T>(
    existing: &mut Vec<T>,
    overlay: Vec<T>,
    kind: &'static str,
    key: impl Fn(&T) -> (&String, bool),
) -> Result<(), ModelError> {
    for item in overlay {
        let (name, remove) = key(&item);
        let position = existing.iter().position(|e| key(e).0 == name);
        match (position, remove) {
            (Some(i), true) => {
                existing.remove(i);
            }
            (None, true) => {
                return Err(ModelError::RemoveUndefined {
                    kind,
                    name: name.clone(),
                })
            }
            (Some(i), false) => existing[i] = item,
            (None, false) => existing.push(item),
        }
    }
    Ok(())
}

// ============================================================================
// Scenario Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ModelError> {
    load_scenarios(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_scenario_from_str(yaml_str: &str) -> Result<Scenario, ModelError> {
    load_scenarios_from_str(&[yaml_str])
}

/// Load and merge multiple scenario files.
///
/// Later files override earlier ones:
/// - simulation settings present in a later file replace earlier ones
/// - groups, allocators, channels and applications with the same name are
///   replaced; `remove: true` deletes them
/// - mobility entries accumulate and apply in order
///
/// References are checked only on the merged result, by [`validate`].
pub fn load_scenarios(paths: &[&Path]) -> Result<Scenario, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario files provided".to_string()));
    }
    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();
    load_scenarios_from_str(&yaml_strs)
}

/// Load and merge multiple scenarios from YAML strings.
pub fn load_scenarios_from_str(yaml_strs: &[&str]) -> Result<Scenario, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario strings provided".to_string()));
    }
    let mut scenario = Scenario::default();
    for yaml_str in yaml_strs {
        let yaml: ScenarioYaml = serde_yaml::from_str(yaml_str)?;
        scenario.merge(yaml)?;
    }
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
simulation:
  stop_time: 4s
  seed: 7
node_groups:
  - name: hosts
    count: 3
channels:
  - name: lan
    kind: contention
    data_rate: 100Mbps
    delay: 6560ns
    members: [hosts]
    subnet: 10.1.2.0
    mask: 255.255.255.0
applications:
  - name: server
    kind: echo_server
    node: "hosts[0]"
    port: 9
    start: 1
    stop: 10s
"#;

    #[test]
    fn test_load_single() {
        let scenario = load_scenario_from_str(BASE).unwrap();
        assert_eq!(scenario.seed(), Some(7));
        assert_eq!(scenario.node_groups()[0].count, 3);
        assert_eq!(scenario.channels()[0].kind, LinkKind::Contention);
        assert_eq!(scenario.applications()[0].start, Quantity::Number(1.0));
        assert_eq!(
            scenario.simulation().stop_time.as_ref().unwrap().to_time().unwrap(),
            SimTime::from_secs(4.0)
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "node_groups:\n  - name: a\n    count: 1\n    colour: red\n";
        assert!(matches!(load_scenario_from_str(yaml), Err(ModelError::YamlError(_))));
    }

    #[test]
    fn test_merge_overrides_by_name() {
        let overlay = r#"
simulation:
  stop_time: 2s
node_groups:
  - name: hosts
    count: 5
  - name: extra
    count: 1
applications:
  - name: server
    remove: true
    kind: echo_server
    node: x
    start: 0
    stop: 0
"#;
        let scenario = load_scenarios_from_str(&[BASE, overlay]).unwrap();
        assert_eq!(scenario.seed(), Some(7));
        assert_eq!(
            scenario.simulation().stop_time.as_ref().unwrap().to_time().unwrap(),
            SimTime::from_secs(2.0)
        );
        let counts: Vec<(&str, usize)> = scenario
            .node_groups()
            .iter()
            .map(|g| (g.name.as_str(), g.count))
            .collect();
        assert_eq!(counts, vec![("hosts", 5), ("extra", 1)]);
        assert!(scenario.applications().is_empty());
    }

    #[test]
    fn test_remove_undefined_fails() {
        let overlay = "channels:\n  - name: nope\n    kind: wireless\n    remove: true\n";
        assert!(matches!(
            load_scenarios_from_str(&[BASE, overlay]),
            Err(ModelError::RemoveUndefined { kind: "channel", .. })
        ));
    }

    #[test]
    fn test_group_size_override() {
        let mut scenario = load_scenario_from_str(BASE).unwrap();
        scenario.set_group_size("hosts", 9).unwrap();
        assert_eq!(scenario.node_groups()[0].count, 9);
        assert!(matches!(scenario.set_group_size("nope", 1), Err(ModelError::GroupNotFound(_))));
    }

    #[test]
    fn test_quantities() {
        assert_eq!(Quantity::Text("2ms".into()).to_time().unwrap(), SimTime::from_millis(2));
        assert_eq!(Quantity::Number(0.5).to_time().unwrap(), SimTime::from_millis(500));
        assert!(Quantity::Number(-1.0).to_time().is_err());
        assert_eq!(Quantity::Text("5Mbps".into()).to_rate().unwrap(), DataRate::from_mbps(5));
        assert_eq!(Quantity::Number(9600.0).to_rate().unwrap().bps(), 9600);
        assert!(Quantity::Number(0.0).to_rate().is_err());
    }

    #[test]
    fn test_remote_forms() {
        let literal: RemoteConfig = serde_yaml::from_str("10.1.1.1").unwrap();
        assert_eq!(literal, RemoteConfig::Address(Ipv4Addr::new(10, 1, 1, 1)));
        let iface: RemoteConfig = serde_yaml::from_str("{ node: \"p2p[0]\", channel: backbone }").unwrap();
        assert!(matches!(iface, RemoteConfig::Interface { .. }));
    }
}
