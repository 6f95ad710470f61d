//! Channel entity: routes frames between the protocol stacks of attached
//! nodes according to a [`LinkModel`].
//!
//! On `Transmit` the model decides receivers and arrival times; the entity
//! schedules one `Timer` per arrival (timer ids index the pending table) and
//! on expiry asks the model for the final [`Reception`]. Delivered frames
//! are handed to the receiving node's stack with `FrameArrival`.

use std::collections::BTreeMap;

use nsim_common::{
    ChannelId, DeviceId, Entity, EntityId, Event, EventPayload, Frame, FrameArrivalEvent, FrameId,
    SimContext, SimError, TraceKind,
};
use tracing::{debug, trace};

use crate::{DeliveryOutcome, LinkError, LinkModel, Member, Reception};

/// Bytes of payload copied into transmit traces.
const TRACE_HEAD_BYTES: usize = 8;

#[derive(Debug)]
struct InFlightFrame {
    frame: Frame,
    bytes: usize,
    remaining: usize,
}

/// Entity owning one channel's link model.
pub struct ChannelEntity {
    id: EntityId,
    channel: ChannelId,
    link: Box<dyn LinkModel>,
    stacks: BTreeMap<DeviceId, EntityId>,
    frames: BTreeMap<FrameId, InFlightFrame>,
    arrivals: BTreeMap<u64, (FrameId, DeviceId)>,
    next_timer: u64,
}

impl ChannelEntity {
    /// Create a channel entity around a link model with no devices yet.
    pub fn new(id: EntityId, channel: ChannelId, link: Box<dyn LinkModel>) -> Self {
        ChannelEntity {
            id,
            channel,
            link,
            stacks: BTreeMap::new(),
            frames: BTreeMap::new(),
            arrivals: BTreeMap::new(),
            next_timer: 0,
        }
    }

    /// Attach a device whose frames are delivered to `stack`.
    pub fn attach(&mut self, member: Member, stack: EntityId) -> Result<(), LinkError> {
        self.link.attach(member)?;
        self.stacks.insert(member.device, stack);
        Ok(())
    }

    /// Channel id.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Underlying link model.
    pub fn link(&self) -> &dyn LinkModel {
        self.link.as_ref()
    }

    /// Arrivals not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.arrivals.len()
    }

    fn handler_error(&self, err: LinkError) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: format!("channel {}: {}", self.channel, err),
        }
    }

    fn member(&self, device: DeviceId) -> Result<Member, SimError> {
        self.link
            .member(device)
            .copied()
            .ok_or_else(|| self.handler_error(LinkError::UnknownDevice(device)))
    }

    fn handle_transmit(&mut self, device: DeviceId, frame: &Frame, ctx: &mut SimContext) -> Result<(), SimError> {
        let sender = self.member(device)?;
        let bytes = frame.wire_size(self.link.kind().framing_overhead());
        let outcome = self
            .link
            .transmit(device, frame, ctx.time())
            .map_err(|e| self.handler_error(e))?;

        match outcome {
            DeliveryOutcome::Scheduled(tx) => {
                trace!(
                    channel = %self.channel,
                    frame = tx.frame.0,
                    start = %tx.start,
                    receivers = tx.arrivals.len(),
                    "transmit"
                );
                ctx.emit(TraceKind::Transmit {
                    channel: self.channel,
                    node: sender.node,
                    device,
                    frame: tx.frame,
                    bytes,
                    start: tx.start,
                    src: frame.datagram.src,
                    dst: frame.datagram.dst,
                    head: frame.datagram.payload.iter().take(TRACE_HEAD_BYTES).copied().collect(),
                });
                for arrival in &tx.arrivals {
                    let timer_id = self.next_timer;
                    self.next_timer += 1;
                    self.arrivals.insert(timer_id, (tx.frame, arrival.device));
                    ctx.post_at(arrival.at, vec![self.id], EventPayload::Timer { timer_id })?;
                }
                self.frames.insert(
                    tx.frame,
                    InFlightFrame {
                        frame: frame.clone(),
                        bytes,
                        remaining: tx.arrivals.len(),
                    },
                );
            }
            DeliveryOutcome::Lost { frame: id, anomaly } => {
                debug!(channel = %self.channel, frame = id.0, %anomaly, "frame lost at transmit");
                ctx.emit(TraceKind::Drop {
                    channel: Some(self.channel),
                    node: sender.node,
                    device: Some(device),
                    frame: Some(id),
                    bytes,
                    anomaly,
                });
            }
        }
        Ok(())
    }

    fn handle_arrival(&mut self, timer_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some((frame_id, device)) = self.arrivals.remove(&timer_id) else {
            return Ok(());
        };
        let receiver = self.member(device)?;
        let reception = self
            .link
            .resolve(frame_id, device)
            .map_err(|e| self.handler_error(e))?;

        let Some(entry) = self.frames.get_mut(&frame_id) else {
            return Ok(());
        };
        entry.remaining -= 1;
        let bytes = entry.bytes;
        let frame = if entry.remaining == 0 {
            self.frames.remove(&frame_id).map(|e| e.frame)
        } else {
            Some(entry.frame.clone())
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        match reception {
            Reception::Delivered => {
                ctx.emit(TraceKind::Deliver {
                    channel: self.channel,
                    node: receiver.node,
                    device,
                    frame: frame_id,
                    bytes,
                    src: frame.datagram.src,
                    dst: frame.datagram.dst,
                });
                if let Some(stack) = self.stacks.get(&device) {
                    ctx.post_immediate(
                        vec![*stack],
                        EventPayload::FrameArrival(FrameArrivalEvent {
                            device,
                            frame_id,
                            frame,
                        }),
                    );
                }
            }
            Reception::Lost(anomaly) => {
                debug!(channel = %self.channel, frame = frame_id.0, %anomaly, "frame lost in flight");
                ctx.emit(TraceKind::Drop {
                    channel: Some(self.channel),
                    node: receiver.node,
                    device: Some(device),
                    frame: Some(frame_id),
                    bytes,
                    anomaly,
                });
            }
        }
        Ok(())
    }
}

impl Entity for ChannelEntity {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Transmit(tx) => self.handle_transmit(tx.device, &tx.frame, ctx),
            EventPayload::Timer { timer_id } => self.handle_arrival(*timer_id, ctx),
            _ => Ok(()),
        }
    }
}
