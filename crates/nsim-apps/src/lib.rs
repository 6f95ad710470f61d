//! # nsim-apps
//!
//! Traffic-generating applications for the simulator.
//!
//! This crate provides:
//!
//! - [`EchoServer`] - listens on a port and sends every datagram it
//!   receives back to its sender, unmodified.
//! - [`EchoClient`] - sends a bounded series of sequence-numbered datagrams
//!   to a server and checks that each echo matches what was sent.
//!
//! Both are entities attached to a node's protocol stack. They are active
//! only between their start and stop times, driven by `Timer` events
//! scheduled from [`AppWindow::initial_timers`].

pub mod client;
pub mod server;

pub use client::{ClientStats, EchoClient, EchoClientConfig};
pub use server::{EchoServer, ServerStats};

use nsim_common::{EventPayload, SimTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// Timer IDs
// ============================================================================

pub(crate) const TIMER_START: u64 = 0;
pub(crate) const TIMER_STOP: u64 = 1;
pub(crate) const TIMER_SEND: u64 = 2;

/// Bytes of the payload holding the big-endian sequence number.
pub const SEQ_BYTES: usize = 4;

/// Active period of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppWindow {
    /// Start time.
    pub start: SimTime,
    /// Stop time.
    pub stop: SimTime,
}

impl AppWindow {
    /// Create a window.
    pub fn new(start: SimTime, stop: SimTime) -> Self {
        AppWindow { start, stop }
    }

    /// Start and stop timers to schedule for the application entity.
    pub fn initial_timers(&self) -> Vec<(SimTime, EventPayload)> {
        vec![
            (self.start, EventPayload::Timer { timer_id: TIMER_START }),
            (self.stop, EventPayload::Timer { timer_id: TIMER_STOP }),
        ]
    }
}

/// Build an echo payload of `size` bytes for sequence number `seq`.
///
/// The first [`SEQ_BYTES`] carry `seq` big-endian (truncated for tiny
/// packets); the rest is a repeating byte counter.
pub fn echo_payload(seq: u32, size: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
    let seq_bytes = seq.to_be_bytes();
    let n = size.min(SEQ_BYTES);
    payload[..n].copy_from_slice(&seq_bytes[..n]);
    payload
}

/// Sequence number carried by an echo payload, if it is long enough.
pub fn payload_seq(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; SEQ_BYTES] = payload.get(..SEQ_BYTES)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_layout() {
        let p = echo_payload(0x0102_0304, 8);
        assert_eq!(p, vec![1, 2, 3, 4, 4, 5, 6, 7]);
        assert_eq!(payload_seq(&p), Some(0x0102_0304));
        assert_eq!(echo_payload(7, 2), vec![0, 0]);
        assert_eq!(payload_seq(&[1, 2]), None);
        assert_eq!(echo_payload(3, 1024).len(), 1024);
    }

    #[test]
    fn test_window_timers() {
        let timers = AppWindow::new(SimTime::from_secs(2.0), SimTime::from_secs(10.0)).initial_timers();
        assert_eq!(timers.len(), 2);
        assert_eq!(timers[0].0, SimTime::from_secs(2.0));
        assert!(matches!(timers[1].1, EventPayload::Timer { timer_id: TIMER_STOP }));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use nsim_common::{
        Datagram, DatagramReceivedEvent, Entity, EntityId, EventPayload, SimContext, SimTime, TraceEvent,
    };

    pub const WIRE: EntityId = EntityId(0);
    pub const CLIENT_PORT: u16 = 49153;

    /// Stand-in network: delivers every datagram to the entity bound to its
    /// destination port after a fixed delay.
    pub struct Wire {
        delay: SimTime,
        ports: BTreeMap<u16, EntityId>,
        pub seen: Vec<Datagram>,
    }

    impl Wire {
        pub fn new(delay: SimTime) -> Self {
            Wire {
                delay,
                ports: BTreeMap::new(),
                seen: Vec::new(),
            }
        }

        pub fn route(mut self, port: u16, app: EntityId) -> Self {
            self.ports.insert(port, app);
            self
        }

        fn carry(&mut self, mut datagram: Datagram, ctx: &mut SimContext) {
            if datagram.src.is_unspecified() {
                datagram.src = Ipv4Addr::new(10, 1, 2, 1);
            }
            self.seen.push(datagram.clone());
            if let Some(app) = self.ports.get(&datagram.dst_port) {
                ctx.post_event(
                    self.delay,
                    vec![*app],
                    EventPayload::DatagramReceived(DatagramReceivedEvent { datagram }),
                );
            }
        }
    }

    /// Run to completion, dispatching to `wire` and `apps` directly so their
    /// state stays inspectable afterwards.
    pub fn run(ctx: &mut SimContext, wire: &mut Wire, apps: &mut [&mut dyn Entity]) -> Vec<TraceEvent> {
        let mut trace = Vec::new();
        while let Some(event) = ctx.next_event(SimTime::MAX) {
            for target in &event.targets {
                if *target == WIRE {
                    if let EventPayload::SendDatagram(send) = &event.payload {
                        wire.carry(send.datagram.clone(), ctx);
                    }
                    continue;
                }
                if let Some(app) = apps.iter_mut().find(|a| a.entity_id() == *target) {
                    ctx.set_source(*target);
                    app.handle_event(&event, ctx).unwrap();
                }
            }
            trace.extend(ctx.take_trace());
        }
        trace
    }
}
