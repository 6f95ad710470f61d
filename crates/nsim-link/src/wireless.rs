//! Wireless broadcast domain with range-limited reachability.

use nsim_common::{DeliveryAnomaly, DeviceId, Frame, FrameId, SimTime};
use nsim_mobility::SharedMobility;
use tracing::trace;

use crate::{
    Arrival, Attachments, DataRate, DeliveryOutcome, LinkError, LinkKind, LinkModel, Member,
    PendingArrivals, Reception, Transmission,
};

/// Propagation speed used by the constant-speed delay model.
pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// Default reachability threshold in metres.
pub const DEFAULT_RANGE_M: f64 = 100.0;

/// Chooses the data rate for each transmission.
pub trait RateControl: Send {
    /// Rate for a frame from `from` to `to` (`None` for broadcast).
    fn data_rate(&mut self, from: DeviceId, to: Option<DeviceId>) -> DataRate;

    /// Name for logging.
    fn name(&self) -> &'static str;
}

/// Same rate for every frame.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate(pub DataRate);

impl Default for FixedRate {
    fn default() -> Self {
        FixedRate(DataRate::from_mbps(54))
    }
}

impl RateControl for FixedRate {
    fn data_rate(&mut self, _from: DeviceId, _to: Option<DeviceId>) -> DataRate {
        self.0
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Wireless domain.
///
/// A receiver hears a frame when its distance from the sender at the start
/// of the transmission is within range. Receivers are sampled once per
/// frame; movement during the frame is ignored. Concurrent frames do not
/// interfere.
pub struct WirelessDomain {
    ssid: String,
    range_m: f64,
    constant_speed_propagation: bool,
    rate_control: Box<dyn RateControl>,
    mobility: SharedMobility,
    attachments: Attachments,
    pending: PendingArrivals,
}

impl WirelessDomain {
    /// Create a domain reading positions from `mobility`.
    pub fn new(ssid: impl Into<String>, mobility: SharedMobility) -> Self {
        WirelessDomain {
            ssid: ssid.into(),
            range_m: DEFAULT_RANGE_M,
            constant_speed_propagation: false,
            rate_control: Box::new(FixedRate::default()),
            mobility,
            attachments: Attachments::default(),
            pending: PendingArrivals::default(),
        }
    }

    /// Set the reachability threshold.
    pub fn with_range(mut self, range_m: f64) -> Self {
        self.range_m = range_m;
        self
    }

    /// Add `distance / c` propagation delay to every arrival.
    pub fn with_constant_speed_propagation(mut self, enabled: bool) -> Self {
        self.constant_speed_propagation = enabled;
        self
    }

    /// Replace the rate selection.
    pub fn with_rate_control(mut self, rate_control: Box<dyn RateControl>) -> Self {
        self.rate_control = rate_control;
        self
    }

    /// Network name.
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// Reachability threshold in metres.
    pub fn range_m(&self) -> f64 {
        self.range_m
    }

    fn propagation(&self, distance_m: f64) -> SimTime {
        if self.constant_speed_propagation {
            SimTime::from_secs(distance_m / SPEED_OF_LIGHT_M_S)
        } else {
            SimTime::ZERO
        }
    }
}

impl std::fmt::Debug for WirelessDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirelessDomain")
            .field("ssid", &self.ssid)
            .field("range_m", &self.range_m)
            .field("rate_control", &self.rate_control.name())
            .field("members", &self.attachments.members.len())
            .finish()
    }
}

impl LinkModel for WirelessDomain {
    fn kind(&self) -> LinkKind {
        LinkKind::Wireless
    }

    fn attach(&mut self, member: Member) -> Result<(), LinkError> {
        self.attachments.attach(member, LinkKind::Wireless)
    }

    fn members(&self) -> &[Member] {
        &self.attachments.members
    }

    fn transmit(&mut self, device: DeviceId, frame: &Frame, now: SimTime) -> Result<DeliveryOutcome, LinkError> {
        let sender = self.attachments.sender(device)?;
        let id = self.attachments.next_frame_id();
        let receivers = self.attachments.receivers(device, frame.dst);
        if receivers.is_empty() {
            return Ok(DeliveryOutcome::Lost {
                frame: id,
                anomaly: DeliveryAnomaly::NoReceiver,
            });
        }

        let unicast = if frame.dst.is_broadcast() {
            None
        } else {
            receivers.first().map(|m| m.device)
        };
        let rate = self.rate_control.data_rate(device, unicast);
        let start = self.attachments.earliest_start(device, now);
        let end = start + rate.tx_time(frame.wire_size(LinkKind::Wireless.framing_overhead()));
        self.attachments.occupy(device, end);

        let mut arrivals = Vec::with_capacity(receivers.len());
        {
            let mobility = self.mobility.read();
            let origin = mobility.position_at(sender.node, start)?;
            for receiver in &receivers {
                let distance = origin.distance_to(&mobility.position_at(receiver.node, start)?);
                if distance > self.range_m {
                    trace!(from = %sender.node, to = %receiver.node, distance, "out of range");
                    continue;
                }
                arrivals.push(Arrival {
                    device: receiver.device,
                    at: end + self.propagation(distance),
                });
            }
        }

        if arrivals.is_empty() {
            return Ok(DeliveryOutcome::Lost {
                frame: id,
                anomaly: DeliveryAnomaly::OutOfRange,
            });
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frame, member};
    use nsim_common::{NodeId, Vector};
    use nsim_mobility::{MobilityModel, MobilityRegistry};

    fn domain(positions: &[(f64, f64)]) -> (WirelessDomain, SharedMobility) {
        let mut reg = MobilityRegistry::new();
        for (i, (x, y)) in positions.iter().enumerate() {
            reg.install(
                NodeId(i as u32),
                MobilityModel::ConstantPosition {
                    position: Vector::new(*x, *y, 0.0),
                },
                SimTime::ZERO,
            )
            .unwrap();
        }
        let shared = reg.shared();
        let mut wifi = WirelessDomain::new("ns-3-ssid", shared.clone());
        for i in 0..positions.len() {
            wifi.attach(member(i as u32)).unwrap();
        }
        (wifi, shared)
    }

    #[test]
    fn test_in_range_unicast() {
        let (mut wifi, _) = domain(&[(0.0, 0.0), (30.0, 40.0)]);
        let DeliveryOutcome::Scheduled(tx) = wifi.transmit(DeviceId(0), &frame(0, Some(1), 100), SimTime::ZERO).unwrap()
        else {
            panic!("expected delivery")
        };
        assert_eq!(tx.arrivals.len(), 1);
        assert_eq!(tx.arrivals[0].at, tx.end);
        assert!(tx.end > SimTime::ZERO);
        assert_eq!(wifi.resolve(tx.frame, DeviceId(1)).unwrap(), Reception::Delivered);
    }

    #[test]
    fn test_out_of_range_unicast_lost() {
        let (mut wifi, _) = domain(&[(0.0, 0.0), (150.0, 0.0)]);
        let outcome = wifi.transmit(DeviceId(0), &frame(0, Some(1), 100), SimTime::ZERO).unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Lost {
                anomaly: DeliveryAnomaly::OutOfRange,
                ..
            }
        ));
        assert_eq!(wifi.in_flight(), 0);
    }

    #[test]
    fn test_broadcast_only_reaches_neighbours() {
        let (mut wifi, _) = domain(&[(0.0, 0.0), (50.0, 0.0), (500.0, 0.0), (0.0, 99.0)]);
        let DeliveryOutcome::Scheduled(tx) = wifi.transmit(DeviceId(0), &frame(0, None, 20), SimTime::ZERO).unwrap()
        else {
            panic!("expected delivery")
        };
        let heard: Vec<DeviceId> = tx.arrivals.iter().map(|a| a.device).collect();
        assert_eq!(heard, vec![DeviceId(1), DeviceId(3)]);
    }

    #[test]
    fn test_constant_speed_delay() {
        let (wifi, _) = domain(&[(0.0, 0.0), (0.0, 0.0)]);
        let wifi = wifi.with_constant_speed_propagation(true);
        assert_eq!(wifi.propagation(SPEED_OF_LIGHT_M_S), SimTime::from_secs(1.0));
        let (mut wifi, _) = domain(&[(0.0, 0.0), (90.0, 0.0)]);
        wifi = wifi.with_constant_speed_propagation(true);
        let DeliveryOutcome::Scheduled(tx) = wifi.transmit(DeviceId(0), &frame(0, Some(1), 10), SimTime::ZERO).unwrap()
        else {
            panic!("expected delivery")
        };
        // 90 m at c is 300 ns.
        assert_eq!(tx.arrivals[0].at - tx.end, SimTime::from_nanos(300));
    }

    struct TwoTier;

    impl RateControl for TwoTier {
        fn data_rate(&mut self, _from: DeviceId, to: Option<DeviceId>) -> DataRate {
            match to {
                Some(_) => DataRate::from_mbps(6),
                None => DataRate::from_mbps(1),
            }
        }

        fn name(&self) -> &'static str {
            "two_tier"
        }
    }

    #[test]
    fn test_pluggable_rate_control() {
        let (wifi, _) = domain(&[(0.0, 0.0), (10.0, 0.0)]);
        let mut wifi = wifi.with_rate_control(Box::new(TwoTier));
        // 64 payload + 28 + 36 = 128 bytes = 1024 bits.
        let DeliveryOutcome::Scheduled(uni) = wifi.transmit(DeviceId(0), &frame(0, Some(1), 64), SimTime::ZERO).unwrap()
        else {
            panic!()
        };
        assert_eq!(uni.end - uni.start, DataRate::from_mbps(6).tx_time(128));
        let DeliveryOutcome::Scheduled(bc) = wifi.transmit(DeviceId(0), &frame(0, None, 64), SimTime::ZERO).unwrap()
        else {
            panic!()
        };
        assert_eq!(bc.start, uni.end);
        assert_eq!(bc.end - bc.start, SimTime::from_micros(1024));
    }

    #[test]
    fn test_missing_position_is_an_error() {
        let reg = MobilityRegistry::new().shared();
        let mut wifi = WirelessDomain::new("x", reg);
        wifi.attach(member(0)).unwrap();
        wifi.attach(member(1)).unwrap();
        assert!(matches!(
            wifi.transmit(DeviceId(0), &frame(0, Some(1), 1), SimTime::ZERO),
            Err(LinkError::Mobility(_))
        ));
    }
}
