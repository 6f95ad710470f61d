//! Full-duplex point-to-point link.

use nsim_common::{DeliveryAnomaly, DeviceId, Frame, FrameId, SimTime};

use crate::{
    Arrival, Attachments, DataRate, DeliveryOutcome, LinkError, LinkKind, LinkModel, Member,
    PendingArrivals, Reception, Transmission,
};

/// Dedicated link between two devices.
///
/// Each direction is independent: a frame starts once the sender finished
/// its previous frame and arrives `tx_time + delay` later. Nothing is lost.
#[derive(Debug)]
pub struct PointToPointLink {
    rate: DataRate,
    delay: SimTime,
    attachments: Attachments,
    pending: PendingArrivals,
}

impl PointToPointLink {
    /// Create a link with the given rate and propagation delay.
    pub fn new(rate: DataRate, delay: SimTime) -> Self {
        PointToPointLink {
            rate,
            delay,
            attachments: Attachments::default(),
            pending: PendingArrivals::default(),
        }
    }

    /// Data rate.
    pub fn rate(&self) -> DataRate {
        self.rate
    }

    /// Propagation delay.
    pub fn delay(&self) -> SimTime {
        self.delay
    }

    /// Time from the start of an idle-link transmission of `bytes` to its
    /// arrival: `delay + bytes * 8 / rate`.
    pub fn delivery_delay(&self, bytes: usize) -> SimTime {
        self.delay + self.rate.tx_time(bytes)
    }
}

impl LinkModel for PointToPointLink {
    fn kind(&self) -> LinkKind {
        LinkKind::PointToPoint
    }

    fn attach(&mut self, member: Member) -> Result<(), LinkError> {
        self.attachments.attach(member, LinkKind::PointToPoint)
    }

    fn members(&self) -> &[Member] {
        &self.attachments.members
    }

    fn transmit(&mut self, device: DeviceId, frame: &Frame, now: SimTime) -> Result<DeliveryOutcome, LinkError> {
        self.attachments.sender(device)?;
        let id: FrameId = self.attachments.next_frame_id();
        let receivers = self.attachments.receivers(device, frame.dst);
        let Some(peer) = receivers.first() else {
            return Ok(DeliveryOutcome::Lost {
                frame: id,
                anomaly: DeliveryAnomaly::NoReceiver,
            });
        };

        let start = self.attachments.earliest_start(device, now);
        let end = start + self.rate.tx_time(frame.wire_size(LinkKind::PointToPoint.framing_overhead()));
        self.attachments.occupy(device, end);

        let arrivals = vec![Arrival {
            device: peer.device,
            at: end + self.delay,
        }];
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
        Ok(Reception::Delivered)
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
