//! # nsim
//!
//! CLI runner for nsim scenarios.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use nsim_model::{build_simulation, load_scenarios, validate, Scenario};
use nsim_runner::{
    resolve_stop_time, AsciiSink, EventLoop, JsonSink, ProgressInfo, RunnerError, SimTime, SimulationStats,
    TraceRecorder,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units.
///
/// Supported formats:
/// - Plain number: `60` (interpreted as seconds)
/// - With unit suffix: `10s`, `500ms`, `1m`, `2h`
/// - Combined units: `1h30m`, `1m30s`
///
/// Units: `ns`, `us`, `ms`, `s`, `m` (minutes), `h`, `d`.
fn parse_duration(s: &str) -> Result<SimTime, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(SimTime::from_secs(secs));
        }
        return Err(format!("Invalid duration '{}'", s));
    }

    let mut total_seconds = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("Invalid duration format: missing unit in '{}'", s))?;
        let (number, tail) = rest.split_at(split);
        if number.is_empty() {
            return Err(format!("Invalid duration format: expected a number in '{}'", s));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let multiplier = match unit {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => {
                return Err(format!(
                    "Unknown duration unit '{}' in '{}'. Use ns, us, ms, s, m, h or d.",
                    unit, s
                ))
            }
        };
        total_seconds += value * multiplier;
        rest = next;
    }
    Ok(SimTime::from_secs(total_seconds))
}

/// Parse a `NAME=N` group size override.
fn parse_group_size(s: &str) -> Result<(String, usize), String> {
    let (name, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=N, got '{}'", s))?;
    let count = count
        .trim()
        .parse()
        .map_err(|_| format!("invalid node count in '{}'", s))?;
    Ok((name.trim().to_string(), count))
}

// ============================================================================
// CLI Configuration
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "nsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from YAML scenario files
    Run(RunnerConfig),
    /// Check scenario files and print the resulting topology
    Validate(ValidateConfig),
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path(s) to YAML scenario file(s). Multiple files are merged in order (later overrides earlier).
    #[arg(required = true)]
    pub scenarios: Vec<PathBuf>,

    /// Stop time, overriding the scenario's.
    /// Accepts plain seconds or units: 60, 10s, 500ms, 1m, 1h30m
    #[arg(short = 't', long, value_parser = parse_duration)]
    pub stop_time: Option<SimTime>,

    /// Random seed (default: the scenario's, else random)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output trace file path (ns-style ASCII)
    #[arg(long)]
    pub ascii: Option<PathBuf>,

    /// Override a node group size, e.g. `--group-size sta1=5`. Repeatable.
    #[arg(long = "group-size", value_name = "NAME=N", value_parser = parse_group_size)]
    pub group_sizes: Vec<(String, usize)>,

    /// Log application sends and receipts
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration for validating scenarios
#[derive(Parser, Debug)]
pub struct ValidateConfig {
    /// Path(s) to YAML scenario file(s).
    #[arg(required = true)]
    pub scenarios: Vec<PathBuf>,

    /// Override a node group size. Repeatable.
    #[arg(long = "group-size", value_name = "NAME=N", value_parser = parse_group_size)]
    pub group_sizes: Vec<(String, usize)>,
}

// ============================================================================
// Commands
// ============================================================================

fn load(paths: &[PathBuf], group_sizes: &[(String, usize)]) -> Result<Scenario, RunnerError> {
    let paths: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    let mut scenario = load_scenarios(&paths)?;
    for (name, count) in group_sizes {
        scenario.set_group_size(name, *count)?;
    }
    Ok(scenario)
}

/// Run a simulation as configured on the command line.
pub fn run_simulation(config: RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let scenario = load(&config.scenarios, &config.group_sizes)?;

    let seed = config.seed.or(scenario.seed()).unwrap_or_else(|| {
        use rand::Rng;
        rand::thread_rng().gen()
    });
    if config.verbose {
        eprintln!("Using seed: {}", seed);
    }

    let simulation = build_simulation(&scenario, seed)?;
    let stop_time = resolve_stop_time(&simulation, config.stop_time)?;
    if config.verbose {
        eprintln!(
            "Built simulation with {} entities, running to {}",
            simulation.entities.len(),
            stop_time
        );
    }

    let mut recorder = TraceRecorder::new();
    if let Some(ref path) = config.output {
        recorder = recorder.with_sink(Box::new(JsonSink::new(Box::new(BufWriter::new(File::create(path)?)))));
    }
    if let Some(ref path) = config.ascii {
        recorder = recorder.with_sink(Box::new(AsciiSink::new(Box::new(BufWriter::new(File::create(path)?)))));
    }

    let mut event_loop = EventLoop::new(simulation, recorder)?;
    let verbose = config.verbose;
    let stats = event_loop.run_with_progress(stop_time, Duration::from_secs(2), |p: &ProgressInfo| {
        if verbose {
            eprintln!(
                "[{:>8.2?}] sim time {} of {}, {} events",
                p.wall_elapsed, p.sim_time, p.target_time, p.events_processed
            );
        }
    })?;

    print_node_summary(&event_loop, &stats);
    Ok(stats)
}

fn print_node_summary(event_loop: &EventLoop, stats: &SimulationStats) {
    eprintln!("{:<12} {:<34} {:>6} {:>6} {:>6}", "node", "addresses", "tx", "rx", "drop");
    for node in event_loop.node_infos() {
        let addresses: Vec<String> = node.addresses.iter().map(|a| a.to_string()).collect();
        let counters = stats.nodes.get(&node.name).cloned().unwrap_or_default();
        eprintln!(
            "{:<12} {:<34} {:>6} {:>6} {:>6}",
            node.name,
            addresses.join(","),
            counters.tx,
            counters.rx,
            counters.dropped
        );
    }
}

fn validate_command(config: ValidateConfig) -> Result<(), RunnerError> {
    let scenario = load(&config.scenarios, &config.group_sizes)?;
    let summary = validate(&scenario)?;

    println!("Scenario OK");
    println!("  nodes: {}", summary.nodes.len());
    for (name, kind, members, subnet) in &summary.channels {
        let subnet = subnet.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  channel {:<12} {:<15} {:>3} devices  {}", name, kind.to_string(), members, subnet);
    }
    println!("  applications: {}", summary.applications.join(", "));
    if summary.random_walkers > 0 {
        println!("  random walkers: {}", summary.random_walkers);
    }
    match summary.stop_time {
        Some(t) => println!("  stop time: {}", t),
        None => println!("  stop time: (until the queue is empty)"),
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins; otherwise warn, plus application logs with --verbose.
    let default = if verbose { "warn,nsim_apps=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            init_logging(config.verbose);
            let stats = run_simulation(config)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Validate(config) => {
            init_logging(false);
            validate_command(config)?;
        }
    }

    Ok(())
}
