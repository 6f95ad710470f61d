//! Entity that advances random walkers.
//!
//! Each walker has one outstanding `Timer` whose id is the node index. On
//! expiry the driver starts a new leg, records the position update and
//! schedules the next retarget.

use nsim_common::{
    Entity, EntityId, Event, EventPayload, NodeId, SimContext, SimError, SimTime, TraceKind,
};
use tracing::trace;

use crate::SharedMobility;

/// Drives every random walker in a [`MobilityRegistry`](crate::MobilityRegistry).
pub struct MobilityDriver {
    id: EntityId,
    registry: SharedMobility,
}

impl MobilityDriver {
    /// Create a driver over a shared registry.
    pub fn new(id: EntityId, registry: SharedMobility) -> Self {
        MobilityDriver { id, registry }
    }

    /// Timer id used for `node`'s retargets.
    pub fn timer_id(node: NodeId) -> u64 {
        node.0 as u64
    }

    /// First retarget of every walker: `(time, timer payload)` pairs to be
    /// posted to this driver before the run starts.
    pub fn initial_timers(&self, at: SimTime) -> Vec<(SimTime, EventPayload)> {
        self.registry
            .read()
            .random_walkers()
            .into_iter()
            .map(|node| {
                (
                    at,
                    EventPayload::Timer {
                        timer_id: Self::timer_id(node),
                    },
                )
            })
            .collect()
    }
}

impl Entity for MobilityDriver {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        let EventPayload::Timer { timer_id } = event.payload else {
            return Ok(());
        };
        let node = NodeId(timer_id as u32);
        let now = ctx.time();
        let retarget = self
            .registry
            .write()
            .retarget(node, now, ctx.rng())
            .map_err(|e| SimError::HandlerError {
                entity: self.id,
                message: e.to_string(),
            })?;

        trace!(
            node = %node,
            position = %retarget.position,
            velocity = %retarget.velocity,
            next = %retarget.next_at,
            "retarget"
        );
        ctx.emit(TraceKind::PositionUpdate {
            node,
            position: retarget.position,
            velocity: retarget.velocity,
        });
        ctx.post_event(
            retarget.next_at - now,
            vec![self.id],
            EventPayload::Timer { timer_id },
        );
        Ok(())
    }
}
