//! UDP echo client.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use nsim_common::{
    AppRole, Datagram, Entity, EntityId, Event, EventHandle, EventPayload, NodeId, SendDatagramEvent,
    SimContext, SimError, SimTime, TraceKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{echo_payload, payload_seq, AppWindow, TIMER_SEND, TIMER_START, TIMER_STOP};

/// Unanswered requests remembered for echo matching; older ones are
/// forgotten first.
pub const MAX_OUTSTANDING_REQUESTS: usize = 256;

/// Configuration of one echo client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoClientConfig {
    /// Server address.
    pub remote: Ipv4Addr,
    /// Server port.
    pub port: u16,
    /// Datagrams to send; 0 sends until stopped.
    pub max_packets: u32,
    /// Spacing between sends.
    pub interval: SimTime,
    /// Payload bytes per datagram.
    pub packet_size: usize,
    /// Active period.
    pub window: AppWindow,
}

/// Client counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Datagrams sent.
    pub sent: u32,
    /// Echoes received.
    pub received: u32,
    /// Echoes that differed from the request.
    pub mismatched: u32,
    /// Round-trip time of each matched echo.
    pub round_trips: Vec<SimTime>,
}

/// Echo client entity.
pub struct EchoClient {
    id: EntityId,
    node: NodeId,
    stack: EntityId,
    local_port: u16,
    config: EchoClientConfig,
    active: bool,
    next_send: Option<EventHandle>,
    outstanding: BTreeMap<u32, (SimTime, Vec<u8>)>,
    stats: ClientStats,
}

impl EchoClient {
    /// Create a client on `node` sending through `stack` from `local_port`.
    pub fn new(id: EntityId, node: NodeId, stack: EntityId, local_port: u16, config: EchoClientConfig) -> Self {
        EchoClient {
            id,
            node,
            stack,
            local_port,
            config,
            active: false,
            next_send: None,
            outstanding: BTreeMap::new(),
            stats: ClientStats::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &EchoClientConfig {
        &self.config
    }

    /// Counters so far.
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Whether the client is between start and stop.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start/stop timers for this client.
    pub fn initial_timers(&self) -> Vec<(SimTime, EventPayload)> {
        self.config.window.initial_timers()
    }

    fn start(&mut self, ctx: &mut SimContext) {
        if self.active {
            return;
        }
        self.active = true;
        debug!(app = self.id.0, node = %self.node, "echo client started");
        self.send(ctx);
    }

    fn stop(&mut self, ctx: &mut SimContext) {
        self.active = false;
        if let Some(handle) = self.next_send.take() {
            if let Err(e) = ctx.cancel(handle) {
                debug!(app = self.id.0, error = %e, "pending send already gone at stop");
            }
        }
        // Echoes arriving after stop are ignored.
        self.outstanding.clear();
        debug!(app = self.id.0, node = %self.node, sent = self.stats.sent, "echo client stopped");
    }

    fn send(&mut self, ctx: &mut SimContext) {
        let limit = self.config.max_packets;
        if limit != 0 && self.stats.sent >= limit {
            return;
        }

        let seq = self.stats.sent;
        let payload = echo_payload(seq, self.config.packet_size);
        if self.outstanding.len() >= MAX_OUTSTANDING_REQUESTS {
            self.outstanding.pop_first();
        }
        self.outstanding.insert(seq, (ctx.time(), payload.clone()));
        let datagram = Datagram::new(self.config.remote, self.local_port, self.config.port, payload);
        ctx.post_immediate(
            vec![self.stack],
            EventPayload::SendDatagram(SendDatagramEvent { datagram }),
        );
        self.stats.sent += 1;

        info!(
            "At time {} client sent {} bytes to {} port {}",
            ctx.time(),
            self.config.packet_size,
            self.config.remote,
            self.config.port
        );
        ctx.emit(TraceKind::AppSend {
            node: self.node,
            app: self.id,
            role: AppRole::Client,
            seq,
            bytes: self.config.packet_size,
            peer: self.config.remote,
            port: self.config.port,
        });

        if limit == 0 || self.stats.sent < limit {
            self.next_send = Some(ctx.post_event(
                self.config.interval,
                vec![self.id],
                EventPayload::Timer { timer_id: TIMER_SEND },
            ));
        }
    }

    fn receive(&mut self, datagram: &Datagram, ctx: &mut SimContext) {
        if !self.active {
            return;
        }
        let seq = payload_seq(&datagram.payload);
        let request = seq.and_then(|s| self.outstanding.remove(&s));
        let matched = match &request {
            Some((_, sent)) => *sent == datagram.payload,
            None => false,
        };

        self.stats.received += 1;
        match request {
            Some((sent_at, _)) if matched => self.stats.round_trips.push(ctx.time() - sent_at),
            _ => self.stats.mismatched += 1,
        }

        info!(
            "At time {} client received {} bytes from {} port {}",
            ctx.time(),
            datagram.payload.len(),
            datagram.src,
            datagram.src_port
        );
        ctx.emit(TraceKind::AppReceive {
            node: self.node,
            app: self.id,
            role: AppRole::Client,
            seq: seq.unwrap_or(0),
            bytes: datagram.payload.len(),
            peer: datagram.src,
            port: datagram.src_port,
            matched,
        });
    }
}

impl Entity for EchoClient {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_START => self.start(ctx),
                TIMER_STOP => self.stop(ctx),
                TIMER_SEND => {
                    self.next_send = None;
                    if self.active {
                        self.send(ctx);
                    }
                }
                _ => {}
            },
            EventPayload::DatagramReceived(rx) => self.receive(&rx.datagram, ctx),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run, Wire, CLIENT_PORT, WIRE};
    use crate::{EchoServer, SEQ_BYTES};
    use nsim_common::{DatagramReceivedEvent, TraceEvent};

    const CLIENT: EntityId = EntityId(1);
    const SERVER: EntityId = EntityId(2);

    fn client(max_packets: u32, interval: f64, start: f64, stop: f64) -> EchoClient {
        EchoClient::new(
            CLIENT,
            NodeId(0),
            WIRE,
            CLIENT_PORT,
            EchoClientConfig {
                remote: Ipv4Addr::new(10, 1, 1, 1),
                port: 9,
                max_packets,
                interval: SimTime::from_secs(interval),
                packet_size: 1024,
                window: AppWindow::new(SimTime::from_secs(start), SimTime::from_secs(stop)),
            },
        )
    }

    fn server() -> EchoServer {
        EchoServer::new(SERVER, NodeId(1), WIRE, 9, AppWindow::new(SimTime::ZERO, SimTime::from_secs(20.0)))
    }

    fn schedule(ctx: &mut SimContext, id: EntityId, timers: Vec<(SimTime, EventPayload)>) {
        for (at, payload) in timers {
            ctx.post_at(at, vec![id], payload).unwrap();
        }
    }

    fn sends(trace: &[TraceEvent]) -> Vec<SimTime> {
        trace
            .iter()
            .filter(|t| matches!(t.kind, TraceKind::AppSend { role: AppRole::Client, .. }))
            .map(|t| t.time)
            .collect()
    }

    #[test]
    fn test_single_packet_at_start() {
        let mut ctx = SimContext::new(0);
        let mut c = client(1, 1.0, 2.0, 10.0);
        let mut s = server();
        schedule(&mut ctx, CLIENT, c.initial_timers());
        schedule(&mut ctx, SERVER, s.initial_timers());
        let mut wire = Wire::new(SimTime::from_millis(5)).route(CLIENT_PORT, CLIENT).route(9, SERVER);

        let trace = run(&mut ctx, &mut wire, &mut [&mut c, &mut s]);
        assert_eq!(sends(&trace), vec![SimTime::from_secs(2.0)]);
        assert_eq!(c.stats().sent, 1);
        assert_eq!(c.stats().received, 1);
        assert_eq!(c.stats().round_trips, vec![SimTime::from_millis(10)]);
        assert_eq!(ctx.pending_events(), 0);
    }

    #[test]
    fn test_round_trips_are_content_identical() {
        let mut ctx = SimContext::new(0);
        let mut c = client(5, 1.0, 1.0, 10.0);
        let mut s = server();
        schedule(&mut ctx, CLIENT, c.initial_timers());
        schedule(&mut ctx, SERVER, s.initial_timers());
        let mut wire = Wire::new(SimTime::from_millis(3)).route(CLIENT_PORT, CLIENT).route(9, SERVER);

        let trace = run(&mut ctx, &mut wire, &mut [&mut c, &mut s]);
        assert_eq!(sends(&trace).len(), 5);
        assert_eq!(c.stats().received, 5);
        assert_eq!(c.stats().mismatched, 0);
        assert_eq!(s.stats().echoed, 5);
        let matched = trace
            .iter()
            .filter(|t| matches!(t.kind, TraceKind::AppReceive { role: AppRole::Client, matched: true, .. }))
            .count();
        assert_eq!(matched, 5);
    }

    #[test]
    fn test_stop_cancels_pending_send() {
        let mut ctx = SimContext::new(0);
        let mut c = client(100, 1.0, 0.0, 2.5);
        schedule(&mut ctx, CLIENT, c.initial_timers());
        let mut wire = Wire::new(SimTime::from_millis(1));

        let trace = run(&mut ctx, &mut wire, &mut [&mut c]);
        assert_eq!(
            sends(&trace),
            vec![SimTime::ZERO, SimTime::from_secs(1.0), SimTime::from_secs(2.0)]
        );
        assert!(!c.is_active());
        assert_eq!(ctx.pending_events(), 0);
        assert_eq!(ctx.time(), SimTime::from_secs(2.5));
    }

    #[test]
    fn test_corrupted_echo_counted() {
        let mut ctx = SimContext::new(0);
        let mut c = client(1, 1.0, 0.0, 10.0);
        schedule(&mut ctx, CLIENT, c.initial_timers());
        let mut bogus = echo_payload(0, 1024);
        bogus[SEQ_BYTES + 1] ^= 0xff;
        let mut reply = Datagram::new(Ipv4Addr::new(10, 1, 2, 1), 9, CLIENT_PORT, bogus);
        reply.src = Ipv4Addr::new(10, 1, 1, 1);
        ctx.post_at(
            SimTime::from_millis(1),
            vec![CLIENT],
            EventPayload::DatagramReceived(DatagramReceivedEvent { datagram: reply }),
        )
        .unwrap();
        let mut wire = Wire::new(SimTime::from_secs(100.0));

        run(&mut ctx, &mut wire, &mut [&mut c]);
        assert_eq!(c.stats().received, 1);
        assert_eq!(c.stats().mismatched, 1);
        assert!(c.stats().round_trips.is_empty());
    }

    #[test]
    fn test_stop_forgets_unanswered_requests() {
        let mut ctx = SimContext::new(0);
        let mut c = client(0, 0.5, 0.0, 3.0);
        schedule(&mut ctx, CLIENT, c.initial_timers());
        // Nothing answers on port 9.
        let mut wire = Wire::new(SimTime::from_millis(1));

        let trace = run(&mut ctx, &mut wire, &mut [&mut c]);
        assert_eq!(sends(&trace).len(), 6);
        assert_eq!(c.stats().received, 0);
        assert!(c.outstanding.is_empty());
    }

    #[test]
    fn test_unanswered_requests_are_capped() {
        let mut ctx = SimContext::new(0);
        let mut c = client(0, 1.0, 0.0, 10.0);
        c.active = true;
        let total = MAX_OUTSTANDING_REQUESTS as u32 + 44;
        for _ in 0..total {
            c.send(&mut ctx);
        }
        assert_eq!(c.stats().sent, total);
        assert_eq!(c.outstanding.len(), MAX_OUTSTANDING_REQUESTS);
        assert_eq!(c.outstanding.keys().next(), Some(&44));
    }
}
