//! UDP echo server.

use nsim_common::{
    AppRole, Datagram, Entity, EntityId, Event, EventPayload, NodeId, SendDatagramEvent, SimContext,
    SimError, SimTime, TraceKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{payload_seq, AppWindow, TIMER_START, TIMER_STOP};

/// Server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Datagrams received while active.
    pub received: u32,
    /// Echoes sent.
    pub echoed: u32,
}

/// Echo server entity.
///
/// The echo is a fresh `SendDatagram` to the node's stack, so the reply
/// travels back through the channels like any other datagram.
pub struct EchoServer {
    id: EntityId,
    node: NodeId,
    stack: EntityId,
    port: u16,
    window: AppWindow,
    active: bool,
    stats: ServerStats,
}

impl EchoServer {
    /// Create a server on `node` listening on `port`.
    pub fn new(id: EntityId, node: NodeId, stack: EntityId, port: u16, window: AppWindow) -> Self {
        EchoServer {
            id,
            node,
            stack,
            port,
            window,
            active: false,
            stats: ServerStats::default(),
        }
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Counters so far.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Start/stop timers for this server.
    pub fn initial_timers(&self) -> Vec<(SimTime, EventPayload)> {
        self.window.initial_timers()
    }

    fn echo(&mut self, request: &Datagram, ctx: &mut SimContext) {
        if !self.active || request.dst_port != self.port {
            debug!(app = self.id.0, port = request.dst_port, "echo server ignoring datagram");
            return;
        }
        let seq = payload_seq(&request.payload).unwrap_or(0);
        let bytes = request.payload.len();
        self.stats.received += 1;
        info!(
            "At time {} server received {} bytes from {} port {}",
            ctx.time(),
            bytes,
            request.src,
            request.src_port
        );
        ctx.emit(TraceKind::AppReceive {
            node: self.node,
            app: self.id,
            role: AppRole::Server,
            seq,
            bytes,
            peer: request.src,
            port: request.src_port,
            matched: true,
        });

        let mut reply = Datagram::new(request.src, self.port, request.src_port, request.payload.clone());
        reply.src = request.dst;
        ctx.post_immediate(
            vec![self.stack],
            EventPayload::SendDatagram(SendDatagramEvent { datagram: reply }),
        );
        self.stats.echoed += 1;
        info!(
            "At time {} server sent {} bytes to {} port {}",
            ctx.time(),
            bytes,
            request.src,
            request.src_port
        );
        ctx.emit(TraceKind::AppSend {
            node: self.node,
            app: self.id,
            role: AppRole::Server,
            seq,
            bytes,
            peer: request.src,
            port: request.src_port,
        });
    }
}

impl Entity for EchoServer {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_START => self.active = true,
                TIMER_STOP => self.active = false,
                _ => {}
            },
            EventPayload::DatagramReceived(rx) => self.echo(&rx.datagram, ctx),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo_payload;
    use crate::test_support::{run, Wire, WIRE};
    use nsim_common::DatagramReceivedEvent;
    use std::net::Ipv4Addr;

    fn request(at: SimTime, ctx: &mut SimContext) {
        let mut datagram = Datagram::new(Ipv4Addr::new(10, 1, 1, 1), 49153, 9, echo_payload(4, 64));
        datagram.src = Ipv4Addr::new(10, 1, 2, 3);
        ctx.post_at(
            at,
            vec![EntityId(2)],
            EventPayload::DatagramReceived(DatagramReceivedEvent { datagram }),
        )
        .unwrap();
    }

    #[test]
    fn test_only_echoes_while_active() {
        let mut server = EchoServer::new(
            EntityId(2),
            NodeId(1),
            WIRE,
            9,
            AppWindow::new(SimTime::from_secs(1.0), SimTime::from_secs(10.0)),
        );
        let mut ctx = SimContext::new(0);
        for (at, payload) in server.initial_timers() {
            ctx.post_at(at, vec![EntityId(2)], payload).unwrap();
        }
        request(SimTime::from_millis(500), &mut ctx);
        request(SimTime::from_secs(5.0), &mut ctx);
        request(SimTime::from_secs(11.0), &mut ctx);
        let mut wire = Wire::new(SimTime::from_millis(1));

        let trace = run(&mut ctx, &mut wire, &mut [&mut server]);
        assert_eq!(server.stats(), ServerStats { received: 1, echoed: 1 });
        assert_eq!(wire.seen.len(), 1);
        let echo = &wire.seen[0];
        assert_eq!(echo.dst, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(echo.src, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!((echo.src_port, echo.dst_port), (9, 49153));
        assert_eq!(echo.payload, echo_payload(4, 64));
        assert!(trace.iter().all(|t| t.time == SimTime::from_secs(5.0)));
    }
}
