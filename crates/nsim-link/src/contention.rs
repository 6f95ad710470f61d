//! Shared contention medium (a bus in the style of a CSMA LAN).
//!
//! A frame occupies the medium for `[start, start + tx_time + delay)`.
//! A sender that can already hear an earlier frame defers until that
//! occupancy ends. Two frames whose starts are no further apart than the
//! propagation delay cannot hear each other; they overlap and both are lost
//! as collisions. Simultaneous starts always collide, even on a medium with
//! zero delay. Backoff and retransmission are not modelled.

use std::collections::BTreeMap;

use nsim_common::{DeliveryAnomaly, DeviceId, Frame, FrameId, SimTime};
use tracing::debug;

use crate::{
    Arrival, Attachments, DataRate, DeliveryOutcome, LinkError, LinkKind, LinkModel, Member,
    PendingArrivals, Reception, Transmission,
};

#[derive(Debug, Clone, Copy)]
struct Occupancy {
    sender: DeviceId,
    start: SimTime,
    end: SimTime,
    collided: bool,
}

/// Shared bus with collision detection.
#[derive(Debug)]
pub struct ContentionMedium {
    rate: DataRate,
    delay: SimTime,
    attachments: Attachments,
    pending: PendingArrivals,
    on_air: BTreeMap<FrameId, Occupancy>,
}

impl ContentionMedium {
    /// Create a medium with the given rate and propagation delay.
    pub fn new(rate: DataRate, delay: SimTime) -> Self {
        ContentionMedium {
            rate,
            delay,
            attachments: Attachments::default(),
            pending: PendingArrivals::default(),
            on_air: BTreeMap::new(),
        }
    }

    /// Pick the start time for a frame of duration `tx` from `device` and
    /// collect the frames it collides with.
    fn contend(&self, device: DeviceId, earliest: SimTime, tx: SimTime) -> (SimTime, Vec<FrameId>) {
        let mut start = earliest;
        // Every deferral moves past one occupancy, so this terminates.
        'retry: for _ in 0..=self.on_air.len() {
            let mut collisions = Vec::new();
            for (id, occ) in &self.on_air {
                if occ.sender == device || occ.end <= start {
                    continue;
                }
                let gap = occ.start.as_nanos().abs_diff(start.as_nanos());
                if gap <= self.delay.as_nanos() {
                    collisions.push(*id);
                } else if occ.start < start || start + tx + self.delay > occ.start {
                    start = occ.end;
                    continue 'retry;
                }
            }
            return (start, collisions);
        }
        (start, Vec::new())
    }
}

impl LinkModel for ContentionMedium {
    fn kind(&self) -> LinkKind {
        LinkKind::Contention
    }

    fn attach(&mut self, member: Member) -> Result<(), LinkError> {
        self.attachments.attach(member, LinkKind::Contention)
    }

    fn members(&self) -> &[Member] {
        &self.attachments.members
    }

    fn transmit(&mut self, device: DeviceId, frame: &Frame, now: SimTime) -> Result<DeliveryOutcome, LinkError> {
        self.attachments.sender(device)?;
        let pending = &self.pending;
        self.on_air
            .retain(|id, occ| occ.end > now || pending.has_frame(*id));

        let id = self.attachments.next_frame_id();
        let tx = self
            .rate
            .tx_time(frame.wire_size(LinkKind::Contention.framing_overhead()));
        let earliest = self.attachments.earliest_start(device, now);
        let (start, collisions) = self.contend(device, earliest, tx);
        let end = start + tx;
        self.attachments.occupy(device, end);

        for other in &collisions {
            if let Some(occ) = self.on_air.get_mut(other) {
                occ.collided = true;
            }
        }
        if !collisions.is_empty() {
            debug!(frame = id.0, with = ?collisions, "collision on contention medium");
        }
        self.on_air.insert(
            id,
            Occupancy {
                sender: device,
                start,
                end: end + self.delay,
                collided: !collisions.is_empty(),
            },
        );

        let receivers = self.attachments.receivers(device, frame.dst);
        if receivers.is_empty() {
            return Ok(DeliveryOutcome::Lost {
                frame: id,
                anomaly: DeliveryAnomaly::NoReceiver,
            });
        }
        let arrivals: Vec<Arrival> = receivers
            .iter()
            .map(|m| Arrival {
                device: m.device,
                at: end + self.delay,
            })
            .collect();
        self.pending.add(id, &arrivals);
        Ok(DeliveryOutcome::Scheduled(Transmission {
            frame: id,
            start,
            end,
            arrivals,
        }))
    }

    fn resolve(&mut self, frame: FrameId, device: DeviceId) -> Result<Reception, LinkError> {
        self.pending.take(frame, device)?;
        let collided = self.on_air.get(&frame).map(|o| o.collided).unwrap_or(false);
        if !self.pending.has_frame(frame) {
            self.on_air.remove(&frame);
        }
        Ok(if collided {
            Reception::Lost(DeliveryAnomaly::Collision)
        } else {
            Reception::Delivered
        })
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
