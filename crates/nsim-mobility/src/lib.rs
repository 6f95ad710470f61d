//! # nsim-mobility
//!
//! Per-node position and velocity for the simulated network.
//!
//! This crate provides:
//! - Motion models ([`MobilityModel`]): constant position, constant velocity
//!   and a bounded random walk
//! - The [`MobilityRegistry`] answering `position_at(node, time)` queries
//! - The [`MobilityDriver`] entity that retargets random walkers
//! - A [`GridPositionAllocator`] for laying out groups of nodes
//!
//! Positions are computed on demand from the current leg (origin, velocity,
//! start time), so no periodic position events are needed. Only random walks
//! schedule events, one per retarget.

mod driver;
mod grid;

pub use driver::MobilityDriver;
pub use grid::{GridLayout, GridPositionAllocator};

use nsim_common::{NodeId, SimTime, Vector};
use parking_lot::RwLock;
use rand::Rng;
use rand_distr::{Distribution, UnitCircle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Re-draws allowed before a random-walk leg is shortened to end on the boundary.
pub const MAX_REDRAWS: usize = 8;

// ============================================================================
// Error Types
// ============================================================================

/// Mobility errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MobilityError {
    /// Query or retarget for a node without a model.
    #[error("node {0} has no mobility model")]
    NotInstalled(NodeId),

    /// A node owns at most one model.
    #[error("node {0} already has a mobility model")]
    AlreadyInstalled(NodeId),

    /// Retarget requested for a node that does not walk.
    #[error("node {0} is not a random walker")]
    NotRandomWalk(NodeId),

    /// Bad model parameters.
    #[error("invalid mobility parameters: {0}")]
    InvalidParams(String),
}

// ============================================================================
// Model Types
// ============================================================================

/// Axis-aligned rectangle in the x/y plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rectangle {
    /// Lower x bound.
    pub x_min: f64,
    /// Upper x bound.
    pub x_max: f64,
    /// Lower y bound.
    pub y_min: f64,
    /// Upper y bound.
    pub y_max: f64,
}

impl Rectangle {
    /// Create a rectangle.
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Rectangle {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Whether the point lies inside or on the boundary.
    pub fn contains(&self, p: &Vector) -> bool {
        p.x >= self.x_min && p.x <= self.x_max && p.y >= self.y_min && p.y <= self.y_max
    }

    /// Nearest point inside the rectangle. The z component is kept.
    pub fn clamp(&self, p: Vector) -> Vector {
        Vector::new(
            p.x.clamp(self.x_min, self.x_max),
            p.y.clamp(self.y_min, self.y_max),
            p.z,
        )
    }

    /// Time until a point starting at `from` and moving at `velocity`
    /// reaches the boundary.
    fn time_to_exit(&self, from: &Vector, velocity: &Vector) -> f64 {
        let axis = |pos: f64, v: f64, lo: f64, hi: f64| {
            if v > 0.0 {
                (hi - pos) / v
            } else if v < 0.0 {
                (lo - pos) / v
            } else {
                f64::INFINITY
            }
        };
        axis(from.x, velocity.x, self.x_min, self.x_max)
            .min(axis(from.y, velocity.y, self.y_min, self.y_max))
            .max(0.0)
    }

    fn validate(&self) -> Result<(), MobilityError> {
        if !(self.x_min < self.x_max && self.y_min < self.y_max) {
            return Err(MobilityError::InvalidParams(format!(
                "empty bounds {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Parameters of a bounded random walk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RandomWalkParams {
    /// Area the walker stays inside.
    pub bounds: Rectangle,
    /// Speed range in m/s, drawn uniformly per leg.
    pub speed: (f64, f64),
    /// Leg duration range in seconds.
    pub interval: (f64, f64),
    /// Pause range in seconds between legs. `(0, 0)` disables pauses.
    pub pause: (f64, f64),
}

impl Default for RandomWalkParams {
    fn default() -> Self {
        RandomWalkParams {
            bounds: Rectangle::new(0.0, 100.0, 0.0, 100.0),
            speed: (2.0, 4.0),
            interval: (1.0, 1.0),
            pause: (0.0, 0.0),
        }
    }
}

impl RandomWalkParams {
    fn validate(&self) -> Result<(), MobilityError> {
        self.bounds.validate()?;
        let check = |name: &str, (lo, hi): (f64, f64), min: f64| {
            if lo.is_nan() || hi.is_nan() || lo < min || lo > hi {
                Err(MobilityError::InvalidParams(format!(
                    "{} range ({}, {}) is invalid",
                    name, lo, hi
                )))
            } else {
                Ok(())
            }
        };
        check("speed", self.speed, 0.0)?;
        check("pause", self.pause, 0.0)?;
        check("interval", self.interval, 0.0)?;
        if self.interval.1 <= 0.0 {
            return Err(MobilityError::InvalidParams(
                "interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Motion model owned by one node.
#[derive(Debug, Clone, PartialEq)]
pub enum MobilityModel {
    /// Fixed point.
    ConstantPosition {
        /// The point.
        position: Vector,
    },
    /// Straight-line motion from the install time onward.
    ConstantVelocity {
        /// Position at install time.
        origin: Vector,
        /// Velocity in m/s.
        velocity: Vector,
    },
    /// Random direction and speed per leg, confined to a rectangle.
    BoundedRandomWalk {
        /// Position at install time.
        start: Vector,
        /// Walk parameters.
        params: RandomWalkParams,
    },
}

impl MobilityModel {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            MobilityModel::ConstantPosition { .. } => "constant_position",
            MobilityModel::ConstantVelocity { .. } => "constant_velocity",
            MobilityModel::BoundedRandomWalk { .. } => "random_walk",
        }
    }
}

/// Straight segment of motion.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Leg {
    origin: Vector,
    velocity: Vector,
    since: SimTime,
    until: SimTime,
}

impl Leg {
    fn stationary(origin: Vector, since: SimTime) -> Self {
        Leg {
            origin,
            velocity: Vector::ZERO,
            since,
            until: SimTime::MAX,
        }
    }

    fn position_at(&self, time: SimTime) -> Vector {
        let t = time.min(self.until).max(self.since);
        let dt = (t - self.since).as_secs_f64();
        self.origin + self.velocity.scale(dt)
    }
}

#[derive(Debug, Clone)]
struct MobilityState {
    model: MobilityModel,
    leg: Leg,
    paused: bool,
}

/// Result of a random-walk retarget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retarget {
    /// Position at the retarget instant.
    pub position: Vector,
    /// Velocity of the new leg.
    pub velocity: Vector,
    /// When the next retarget is due.
    pub next_at: SimTime,
}

// ============================================================================
// Registry
// ============================================================================

/// Mobility registry shared between the driver and wireless channels.
pub type SharedMobility = Arc<RwLock<MobilityRegistry>>;

/// Mobility state of every node that has a model.
#[derive(Debug, Default)]
pub struct MobilityRegistry {
    nodes: BTreeMap<NodeId, MobilityState>,
}

impl MobilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedMobility {
        Arc::new(RwLock::new(self))
    }

    /// Give `node` a motion model starting at `time`.
    pub fn install(
        &mut self,
        node: NodeId,
        model: MobilityModel,
        time: SimTime,
    ) -> Result<(), MobilityError> {
        if self.nodes.contains_key(&node) {
            return Err(MobilityError::AlreadyInstalled(node));
        }
        let leg = match &model {
            MobilityModel::ConstantPosition { position } => Leg::stationary(*position, time),
            MobilityModel::ConstantVelocity { origin, velocity } => Leg {
                origin: *origin,
                velocity: *velocity,
                since: time,
                until: SimTime::MAX,
            },
            MobilityModel::BoundedRandomWalk { start, params } => {
                params.validate()?;
                if !params.bounds.contains(start) {
                    return Err(MobilityError::InvalidParams(format!(
                        "start {} of node {} lies outside {:?}",
                        start, node, params.bounds
                    )));
                }
                Leg::stationary(*start, time)
            }
        };
        tracing::debug!(node = %node, model = model.label(), "installed mobility");
        self.nodes.insert(
            node,
            MobilityState {
                model,
                leg,
                paused: true,
            },
        );
        Ok(())
    }

    /// Position of `node` at `time`.
    ///
    /// Pure: repeated queries without an intervening retarget return the
    /// same value.
    pub fn position_at(&self, node: NodeId, time: SimTime) -> Result<Vector, MobilityError> {
        let state = self
            .nodes
            .get(&node)
            .ok_or(MobilityError::NotInstalled(node))?;
        let position = state.leg.position_at(time);
        Ok(match &state.model {
            MobilityModel::BoundedRandomWalk { params, .. } => params.bounds.clamp(position),
            _ => position,
        })
    }

    /// Velocity of `node` at `time`.
    pub fn velocity_at(&self, node: NodeId, time: SimTime) -> Result<Vector, MobilityError> {
        let state = self
            .nodes
            .get(&node)
            .ok_or(MobilityError::NotInstalled(node))?;
        if time < state.leg.since || time >= state.leg.until {
            return Ok(Vector::ZERO);
        }
        Ok(state.leg.velocity)
    }

    /// Whether `node` has a model.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Random walkers in node order.
    pub fn random_walkers(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, s)| matches!(s.model, MobilityModel::BoundedRandomWalk { .. }))
            .map(|(node, _)| *node)
            .collect()
    }

    /// Start a new leg for a random walker at `now`.
    ///
    /// Direction is uniform on the circle and speed and duration are uniform
    /// in their ranges. A leg whose end point would leave the bounds is
    /// re-drawn up to [`MAX_REDRAWS`] times, then shortened to end on the
    /// boundary.
    pub fn retarget<R: Rng + ?Sized>(
        &mut self,
        node: NodeId,
        now: SimTime,
        rng: &mut R,
    ) -> Result<Retarget, MobilityError> {
        let state = self
            .nodes
            .get_mut(&node)
            .ok_or(MobilityError::NotInstalled(node))?;
        let params = match &state.model {
            MobilityModel::BoundedRandomWalk { params, .. } => *params,
            _ => return Err(MobilityError::NotRandomWalk(node)),
        };
        let position = params.bounds.clamp(state.leg.position_at(now));

        let pausing = !state.paused && params.pause.1 > 0.0;
        let (velocity, duration) = if pausing {
            (Vector::ZERO, draw(rng, params.pause))
        } else {
            choose_leg(rng, &params, &position)
        };

        let duration = SimTime::from_secs(duration).max(SimTime::EPSILON);
        let next_at = now + duration;
        state.leg = Leg {
            origin: position,
            velocity,
            since: now,
            until: next_at,
        };
        state.paused = pausing;

        Ok(Retarget {
            position,
            velocity,
            next_at,
        })
    }
}

fn draw<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if lo >= hi {
        lo
    } else {
        rng.gen_range(lo..hi)
    }
}

/// Pick velocity and duration for a moving leg that stays inside the bounds.
fn choose_leg<R: Rng + ?Sized>(rng: &mut R, params: &RandomWalkParams, from: &Vector) -> (Vector, f64) {
    let mut last = (Vector::ZERO, draw(rng, params.interval));
    for _ in 0..MAX_REDRAWS {
        let [dx, dy]: [f64; 2] = UnitCircle.sample(rng);
        let speed = draw(rng, params.speed);
        let duration = draw(rng, params.interval);
        let velocity = Vector::new(dx * speed, dy * speed, 0.0);
        let end = *from + velocity.scale(duration);
        if params.bounds.contains(&end) {
            return (velocity, duration);
        }
        last = (velocity, duration);
    }

    let (velocity, duration) = last;
    let clipped = params.bounds.time_to_exit(from, &velocity).min(duration);
    if clipped * 1e9 < 1.0 {
        // Already on the boundary heading out: stand still for this leg.
        return (Vector::ZERO, duration);
    }
    (velocity, clipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_constant_position_is_time_invariant() {
        let mut reg = MobilityRegistry::new();
        let p = Vector::new(10.0, 10.0, 0.0);
        reg.install(NodeId(0), MobilityModel::ConstantPosition { position: p }, SimTime::ZERO)
            .unwrap();
        let t = SimTime::from_secs(5.5);
        assert_eq!(reg.position_at(NodeId(0), t).unwrap(), p);
        assert_eq!(reg.position_at(NodeId(0), t).unwrap(), reg.position_at(NodeId(0), t).unwrap());
        assert_eq!(reg.position_at(NodeId(0), SimTime::from_secs(1000.0)).unwrap(), p);
    }

    #[test]
    fn test_constant_velocity() {
        let mut reg = MobilityRegistry::new();
        reg.install(
            NodeId(1),
            MobilityModel::ConstantVelocity {
                origin: Vector::new(5.0, 0.0, 0.0),
                velocity: Vector::new(5.0, 0.0, 0.0),
            },
            SimTime::from_secs(1.0),
        )
        .unwrap();

        let at = |s: f64| reg.position_at(NodeId(1), SimTime::from_secs(s)).unwrap();
        assert_eq!(at(1.0), Vector::new(5.0, 0.0, 0.0));
        assert!((at(3.0).x - 15.0).abs() < 1e-9);
        assert_eq!(at(3.0), at(3.0));
        // Before install the node sits at its origin.
        assert_eq!(at(0.5), Vector::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_install_twice_rejected() {
        let mut reg = MobilityRegistry::new();
        let model = MobilityModel::ConstantPosition { position: Vector::ZERO };
        reg.install(NodeId(0), model.clone(), SimTime::ZERO).unwrap();
        assert_eq!(
            reg.install(NodeId(0), model, SimTime::ZERO),
            Err(MobilityError::AlreadyInstalled(NodeId(0)))
        );
        assert_eq!(
            reg.position_at(NodeId(9), SimTime::ZERO),
            Err(MobilityError::NotInstalled(NodeId(9)))
        );
    }

    #[test]
    fn test_random_walk_stays_in_bounds() {
        let bounds = Rectangle::new(0.0, 100.0, -50.0, 50.0);
        let params = RandomWalkParams {
            bounds,
            speed: (2.0, 4.0),
            interval: (1.0, 1.0),
            pause: (0.0, 0.0),
        };
        let mut reg = MobilityRegistry::new();
        reg.install(
            NodeId(3),
            MobilityModel::BoundedRandomWalk {
                start: Vector::new(99.0, 49.0, 0.0),
                params,
            },
            SimTime::ZERO,
        )
        .unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut now = SimTime::ZERO;
        for _ in 0..500 {
            let r = reg.retarget(NodeId(3), now, &mut rng).unwrap();
            assert!(bounds.contains(&r.position));
            assert!(r.next_at > now);
            let mid = SimTime::from_nanos((now.as_nanos() + r.next_at.as_nanos()) / 2);
            assert!(bounds.contains(&reg.position_at(NodeId(3), mid).unwrap()));
            now = r.next_at;
        }
        assert!(bounds.contains(&reg.position_at(NodeId(3), now).unwrap()));
    }

    #[test]
    fn test_random_walk_lazy_position() {
        let mut reg = MobilityRegistry::new();
        reg.install(
            NodeId(0),
            MobilityModel::BoundedRandomWalk {
                start: Vector::new(50.0, 0.0, 0.0),
                params: RandomWalkParams {
                    bounds: Rectangle::new(0.0, 100.0, -50.0, 50.0),
                    ..Default::default()
                },
            },
            SimTime::ZERO,
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let r = reg.retarget(NodeId(0), SimTime::ZERO, &mut rng).unwrap();
        let half = SimTime::from_millis(500);
        let expected = r.position + r.velocity.scale(0.5);
        let got = reg.position_at(NodeId(0), half).unwrap();
        assert!(got.distance_to(&expected) < 1e-9);
        assert_eq!(reg.velocity_at(NodeId(0), half).unwrap(), r.velocity);
        let speed = r.velocity.length();
        assert!((2.0..=4.0).contains(&speed));
    }

    #[test]
    fn test_pause_alternates_with_motion() {
        let mut reg = MobilityRegistry::new();
        reg.install(
            NodeId(0),
            MobilityModel::BoundedRandomWalk {
                start: Vector::new(50.0, 50.0, 0.0),
                params: RandomWalkParams {
                    pause: (0.5, 0.5),
                    ..Default::default()
                },
            },
            SimTime::ZERO,
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let moving = reg.retarget(NodeId(0), SimTime::ZERO, &mut rng).unwrap();
        assert!(moving.velocity.length() > 0.0);
        let paused = reg.retarget(NodeId(0), moving.next_at, &mut rng).unwrap();
        assert_eq!(paused.velocity, Vector::ZERO);
        assert_eq!(paused.next_at, moving.next_at + SimTime::from_millis(500));
    }

    #[test]
    fn test_invalid_walk_params() {
        let mut reg = MobilityRegistry::new();
        let err = reg
            .install(
                NodeId(0),
                MobilityModel::BoundedRandomWalk {
                    start: Vector::ZERO,
                    params: RandomWalkParams {
                        speed: (4.0, 2.0),
                        ..Default::default()
                    },
                },
                SimTime::ZERO,
            )
            .unwrap_err();
        assert!(matches!(err, MobilityError::InvalidParams(_)));

        let outside = reg.install(
            NodeId(1),
            MobilityModel::BoundedRandomWalk {
                start: Vector::new(-1.0, 0.0, 0.0),
                params: RandomWalkParams::default(),
            },
            SimTime::ZERO,
        );
        assert!(matches!(outside, Err(MobilityError::InvalidParams(_))));
    }

    #[test]
    fn test_retarget_rejects_static_node() {
        let mut reg = MobilityRegistry::new();
        reg.install(NodeId(0), MobilityModel::ConstantPosition { position: Vector::ZERO }, SimTime::ZERO)
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(
            reg.retarget(NodeId(0), SimTime::ZERO, &mut rng),
            Err(MobilityError::NotRandomWalk(NodeId(0)))
        );
        assert!(reg.random_walkers().is_empty());
    }
}
