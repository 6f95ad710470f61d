//! # nsim-runner library
//!
//! Library interface for the nsim simulation runner.
//!
//! This crate provides:
//! - [`EventLoop`]: drives a [`BuiltSimulation`] to a stop time
//! - [`SimulationStats`]: counters aggregated from the packet trace
//! - [`TraceRecorder`] and its JSON, ASCII and in-memory sinks
//!
//! The loop is single-threaded: each event runs to completion before the
//! next one is popped, and the trace records it produced are drained and
//! forwarded before the next dispatch.

pub mod sinks;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nsim_common::{AppRole, EntityId, SchedulingError, SimContext, SimError, TraceEvent, TraceKind};
pub use nsim_common::SimTime;
use nsim_model::{AppInfo, AppKind, BuiltSimulation, NodeInfo};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub use sinks::{AsciiSink, JsonSink, MemorySink, TraceHandle, TraceRecorder, TraceSink};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] nsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// Scheduling error while seeding the queue.
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Frames put on a channel by this node.
    pub tx: u64,
    /// Frames delivered to this node.
    pub rx: u64,
    /// Frames or datagrams lost at this node.
    pub dropped: u64,
}

/// Per-application counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStats {
    /// Application name.
    pub name: String,
    /// Application kind.
    pub kind: AppKind,
    /// Host node name.
    pub node: String,
    /// Datagrams sent (requests for clients, echoes for servers).
    pub sent: u64,
    /// Datagrams received.
    pub received: u64,
    /// Echoes that differed from their request (clients only).
    pub mismatched: u64,
    /// Shortest round trip in milliseconds.
    pub rtt_min_ms: Option<f64>,
    /// Mean round trip in milliseconds.
    pub rtt_mean_ms: Option<f64>,
    /// Longest round trip in milliseconds.
    pub rtt_max_ms: Option<f64>,
    #[serde(skip)]
    round_trips: Vec<SimTime>,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Frames put on channels.
    pub frames_transmitted: u64,
    /// Frames delivered to a device.
    pub frames_delivered: u64,
    /// Losses of any kind.
    pub frames_dropped: u64,
    /// Losses by anomaly label.
    pub drops: BTreeMap<String, u64>,
    /// Position changes of random walkers.
    pub position_updates: u64,
    /// Datagrams sent by echo clients.
    pub requests_sent: u64,
    /// Echoes sent by echo servers.
    pub echoes_sent: u64,
    /// Echoes received by echo clients.
    pub echoes_received: u64,
    /// Echoes that differed from their request.
    pub echoes_mismatched: u64,
    /// Per-node counters, by node name.
    pub nodes: BTreeMap<String, NodeStats>,
    /// Per-application counters in declaration order.
    pub applications: Vec<AppStats>,
    /// Final simulation time in nanoseconds.
    pub simulation_time_ns: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

impl SimulationStats {
    fn new(nodes: &[NodeInfo], apps: &[AppInfo]) -> Self {
        SimulationStats {
            nodes: nodes
                .iter()
                .map(|n| (n.name.clone(), NodeStats::default()))
                .collect(),
            applications: apps
                .iter()
                .map(|a| AppStats {
                    name: a.name.clone(),
                    kind: a.kind,
                    node: nodes
                        .get(a.node.index())
                        .map(|n| n.name.clone())
                        .unwrap_or_else(|| a.node.to_string()),
                    sent: 0,
                    received: 0,
                    mismatched: 0,
                    rtt_min_ms: None,
                    rtt_mean_ms: None,
                    rtt_max_ms: None,
                    round_trips: Vec::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Statistics of the application called `name`.
    pub fn application(&self, name: &str) -> Option<&AppStats> {
        self.applications.iter().find(|a| a.name == name)
    }

    /// Drops with the given anomaly label.
    pub fn drops_of(&self, label: &str) -> u64 {
        self.drops.get(label).copied().unwrap_or(0)
    }

    fn finish_round_trips(&mut self) {
        for app in &mut self.applications {
            let ms: Vec<f64> = app.round_trips.iter().map(|t| t.as_secs_f64() * 1e3).collect();
            if ms.is_empty() {
                continue;
            }
            app.rtt_min_ms = ms.iter().copied().reduce(f64::min);
            app.rtt_max_ms = ms.iter().copied().reduce(f64::max);
            app.rtt_mean_ms = Some(ms.iter().sum::<f64>() / ms.len() as f64);
        }
    }
}

/// Folds trace records into [`SimulationStats`].
struct StatsCollector {
    node_names: Vec<String>,
    app_index: BTreeMap<EntityId, usize>,
    pending_requests: BTreeMap<(EntityId, u32), SimTime>,
}

impl StatsCollector {
    fn new(nodes: &[NodeInfo], apps: &[AppInfo]) -> Self {
        StatsCollector {
            node_names: nodes.iter().map(|n| n.name.clone()).collect(),
            app_index: apps.iter().enumerate().map(|(i, a)| (a.entity, i)).collect(),
            pending_requests: BTreeMap::new(),
        }
    }

    fn node_stats<'a>(&self, stats: &'a mut SimulationStats, event: &TraceEvent) -> Option<&'a mut NodeStats> {
        let name = self.node_names.get(event.node().index())?;
        stats.nodes.get_mut(name)
    }

    fn observe(&mut self, stats: &mut SimulationStats, event: &TraceEvent) {
        match &event.kind {
            TraceKind::Transmit { .. } => {
                stats.frames_transmitted += 1;
                if let Some(node) = self.node_stats(stats, event) {
                    node.tx += 1;
                }
            }
            TraceKind::Deliver { .. } => {
                stats.frames_delivered += 1;
                if let Some(node) = self.node_stats(stats, event) {
                    node.rx += 1;
                }
            }
            TraceKind::Drop { anomaly, .. } => {
                stats.frames_dropped += 1;
                *stats.drops.entry(anomaly.as_label().to_string()).or_default() += 1;
                if let Some(node) = self.node_stats(stats, event) {
                    node.dropped += 1;
                }
            }
            TraceKind::PositionUpdate { .. } => stats.position_updates += 1,
            TraceKind::AppSend { app, role, seq, .. } => {
                match role {
                    AppRole::Client => {
                        stats.requests_sent += 1;
                        self.pending_requests.insert((*app, *seq), event.time);
                    }
                    AppRole::Server => stats.echoes_sent += 1,
                }
                if let Some(i) = self.app_index.get(app) {
                    stats.applications[*i].sent += 1;
                }
            }
            TraceKind::AppReceive {
                app, role, seq, matched, ..
            } => {
                let sent_at = self.pending_requests.remove(&(*app, *seq));
                let Some(i) = self.app_index.get(app).copied() else { return };
                let entry = &mut stats.applications[i];
                entry.received += 1;
                if *role == AppRole::Client {
                    stats.echoes_received += 1;
                    match (matched, sent_at) {
                        (true, Some(at)) => entry.round_trips.push(event.time - at),
                        _ => {
                            entry.mismatched += 1;
                            stats.echoes_mismatched += 1;
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback during simulation.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// Target stop time.
    pub target_time: SimTime,
    /// Wall clock time elapsed since the run started.
    pub wall_elapsed: Duration,
    /// Events processed so far.
    pub events_processed: u64,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    stats: SimulationStats,
    collector: StatsCollector,
}

impl EventLoop {
    /// Create an event loop and seed its queue with the simulation's
    /// initial events.
    pub fn new(simulation: BuiltSimulation, mut trace: TraceRecorder) -> Result<Self, RunnerError> {
        let mut context = SimContext::new(simulation.seed);
        for event in &simulation.initial_events {
            context.post_at(event.time, event.targets.clone(), event.payload.clone())?;
        }
        trace.set_node_names(simulation.node_infos.iter().map(|n| n.name.clone()).collect());
        let stats = SimulationStats::new(&simulation.node_infos, &simulation.app_infos);
        let collector = StatsCollector::new(&simulation.node_infos, &simulation.app_infos);
        debug!(
            entities = simulation.entities.len(),
            initial_events = simulation.initial_events.len(),
            "event loop ready"
        );
        Ok(EventLoop {
            simulation,
            context,
            trace,
            stats,
            collector,
        })
    }

    /// Run until the queue is empty or the next event lies beyond
    /// `stop_time`.
    pub fn run(&mut self, stop_time: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(stop_time, Duration::MAX, |_| {})
    }

    /// Run like [`EventLoop::run`], invoking `on_progress` at most once per
    /// `interval` of wall clock time and once at the end.
    pub fn run_with_progress<F>(
        &mut self,
        stop_time: SimTime,
        interval: Duration,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&ProgressInfo),
    {
        let started = Instant::now();
        let mut last_report = started;
        let wall_before = self.stats.wall_time_ms;

        while let Some(event) = self.context.next_event(stop_time) {
            self.simulation.entities.dispatch_event(&event, &mut self.context)?;
            self.stats.total_events += 1;

            let records = self.context.take_trace();
            for record in &records {
                self.collector.observe(&mut self.stats, record);
            }
            if self.trace.is_enabled() {
                self.trace.record(&records)?;
            }

            if last_report.elapsed() >= interval {
                on_progress(&self.progress(stop_time, started));
                last_report = Instant::now();
            }
        }

        if let Some(next) = self.context.next_event_time() {
            debug!(
                pending = self.context.pending_events(),
                next = %next,
                "stop time reached with events pending"
            );
        }

        self.stats.simulation_time_ns = self.context.time().as_nanos();
        self.stats.wall_time_ms = wall_before + started.elapsed().as_millis() as u64;
        self.stats.finish_round_trips();
        on_progress(&self.progress(stop_time, started));
        self.trace.flush()?;

        info!(
            events = self.stats.total_events,
            sim_time = %self.context.time(),
            "simulation finished"
        );
        Ok(self.stats.clone())
    }

    fn progress(&self, stop_time: SimTime, started: Instant) -> ProgressInfo {
        ProgressInfo {
            sim_time: self.context.time(),
            target_time: stop_time,
            wall_elapsed: started.elapsed(),
            events_processed: self.stats.total_events,
        }
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Node information of the simulation.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Application information of the simulation.
    pub fn app_infos(&self) -> &[AppInfo] {
        &self.simulation.app_infos
    }

    /// The simulation being run.
    pub fn simulation(&self) -> &BuiltSimulation {
        &self.simulation
    }

    /// Current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Events still queued.
    pub fn pending_events(&self) -> usize {
        self.context.pending_events()
    }
}

/// Create an event loop without trace sinks.
pub fn create_event_loop(simulation: BuiltSimulation) -> Result<EventLoop, RunnerError> {
    EventLoop::new(simulation, TraceRecorder::new())
}

/// Resolve the stop time of a run: explicit override, then the scenario's.
pub fn resolve_stop_time(simulation: &BuiltSimulation, stop_time: Option<SimTime>) -> Result<SimTime, RunnerError> {
    match stop_time.or(simulation.stop_time) {
        Some(t) => Ok(t),
        None if simulation.initial_events.is_empty() => Ok(SimTime::ZERO),
        None => {
            let has_walkers = !simulation.mobility.read().random_walkers().is_empty();
            if has_walkers {
                Err(RunnerError::ConfigError(
                    "random-walk mobility needs a stop time".to_string(),
                ))
            } else {
                Ok(SimTime::MAX)
            }
        }
    }
}

// Re-export key types for convenience
pub use nsim_model::{build_simulation, load_scenario, load_scenario_from_str, load_scenarios, Scenario};
