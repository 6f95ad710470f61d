//! Trace sinks.
//!
//! The event loop drains the trace buffer of the simulation context after
//! every dispatched event and hands each record to a [`TraceRecorder`],
//! which fans it out to the configured sinks:
//! - [`JsonSink`]: one JSON array, written on flush, payload heads in hex
//! - [`AsciiSink`]: one ns-style line per link event, written as it happens
//! - [`MemorySink`]: keeps everything in memory for inspection

use std::io::Write;
use std::sync::Arc;

use nsim_common::{NodeId, TraceEvent, TraceKind};
use parking_lot::Mutex;

use crate::RunnerError;

/// Receiver of trace records.
pub trait TraceSink: Send {
    /// Handle one record. `node_name` resolves node ids to scenario names.
    fn record(&mut self, event: &TraceEvent, node_name: &dyn Fn(NodeId) -> String) -> Result<(), RunnerError>;

    /// Write out anything buffered.
    fn flush(&mut self) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Fans trace records out to any number of sinks.
#[derive(Default)]
pub struct TraceRecorder {
    sinks: Vec<Box<dyn TraceSink>>,
    node_names: Vec<String>,
}

impl TraceRecorder {
    /// Create a recorder without sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Whether any sink is attached.
    pub fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Names to report nodes under, indexed by node id.
    pub fn set_node_names(&mut self, names: Vec<String>) {
        self.node_names = names;
    }

    /// Record a batch of events in order.
    pub fn record(&mut self, events: &[TraceEvent]) -> Result<(), RunnerError> {
        let names = &self.node_names;
        let node_name = |node: NodeId| {
            names
                .get(node.index())
                .cloned()
                .unwrap_or_else(|| node.to_string())
        };
        for sink in &mut self.sinks {
            for event in events {
                sink.record(event, &node_name)?;
            }
        }
        Ok(())
    }

    /// Flush every sink.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// JSON
// ============================================================================

/// Writes all records as one pretty-printed JSON array on flush.
///
/// Each entry carries the record fields plus `time_s` and `node_name`;
/// payload heads are hex strings.
pub struct JsonSink {
    output: Box<dyn Write + Send>,
    entries: Vec<serde_json::Value>,
}

impl JsonSink {
    /// Create a sink writing to `output`.
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        JsonSink {
            output,
            entries: Vec::new(),
        }
    }
}

impl TraceSink for JsonSink {
    fn record(&mut self, event: &TraceEvent, node_name: &dyn Fn(NodeId) -> String) -> Result<(), RunnerError> {
        let mut value = serde_json::to_value(event)?;
        if let Some(object) = value.as_object_mut() {
            if let TraceKind::Transmit { head, .. } = &event.kind {
                object.insert("head".to_string(), serde_json::Value::String(hex::encode(head)));
            }
            object.insert("time_s".to_string(), serde_json::json!(event.time.as_secs_f64()));
            object.insert(
                "node_name".to_string(),
                serde_json::Value::String(node_name(event.node())),
            );
        }
        self.entries.push(value);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RunnerError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        writeln!(self.output, "{}", json)?;
        self.output.flush()?;
        Ok(())
    }
}

// ============================================================================
// ASCII
// ============================================================================

/// Writes ns-style ASCII trace lines.
///
/// ```text
/// + 2.000000000 /NodeList/6/DeviceList/9/Channel/2 1070 10.1.3.4 > 10.1.2.3
/// r 2.000092000 /NodeList/4/DeviceList/5/Channel/1 1070 10.1.3.4 > 10.1.2.3
/// d 2.000000000 /NodeList/3/DeviceList/4/Channel/2 1070 collision
/// ```
///
/// Only link and drop records are written; application and mobility records
/// have no line form.
pub struct AsciiSink {
    output: Box<dyn Write + Send>,
}

impl AsciiSink {
    /// Create a sink writing to `output`.
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        AsciiSink { output }
    }
}

/// Format one record as an ASCII trace line.
pub fn ascii_line(event: &TraceEvent) -> Option<String> {
    let time = event.time.as_secs_f64();
    match &event.kind {
        TraceKind::Transmit {
            channel,
            node,
            device,
            bytes,
            src,
            dst,
            ..
        } => Some(format!(
            "+ {:.9} /NodeList/{}/DeviceList/{}/Channel/{} {} {} > {}",
            time, node.0, device.0, channel.0, bytes, src, dst
        )),
        TraceKind::Deliver {
            channel,
            node,
            device,
            bytes,
            src,
            dst,
            ..
        } => Some(format!(
            "r {:.9} /NodeList/{}/DeviceList/{}/Channel/{} {} {} > {}",
            time, node.0, device.0, channel.0, bytes, src, dst
        )),
        TraceKind::Drop {
            channel,
            node,
            device,
            bytes,
            anomaly,
            ..
        } => {
            let mut path = format!("/NodeList/{}", node.0);
            if let Some(device) = device {
                path.push_str(&format!("/DeviceList/{}", device.0));
            }
            if let Some(channel) = channel {
                path.push_str(&format!("/Channel/{}", channel.0));
            }
            Some(format!("d {:.9} {} {} {}", time, path, bytes, anomaly))
        }
        _ => None,
    }
}

impl TraceSink for AsciiSink {
    fn record(&mut self, event: &TraceEvent, _node_name: &dyn Fn(NodeId) -> String) -> Result<(), RunnerError> {
        if let Some(line) = ascii_line(event) {
            writeln!(self.output, "{}", line)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RunnerError> {
        self.output.flush()?;
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Shared view of the records collected by a [`MemorySink`].
pub type TraceHandle = Arc<Mutex<Vec<TraceEvent>>>;

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    events: TraceHandle,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the collected records, usable after the sink is boxed.
    pub fn handle(&self) -> TraceHandle {
        self.events.clone()
    }
}

impl TraceSink for MemorySink {
    fn record(&mut self, event: &TraceEvent, _node_name: &dyn Fn(NodeId) -> String) -> Result<(), RunnerError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsim_common::{ChannelId, DeliveryAnomaly, DeviceId, FrameId, SimTime};
    use std::net::Ipv4Addr;

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn transmit() -> TraceEvent {
        TraceEvent {
            time: SimTime::from_secs(2.0),
            kind: TraceKind::Transmit {
                channel: ChannelId(0),
                node: NodeId(1),
                device: DeviceId(2),
                frame: FrameId(0),
                bytes: 1054,
                start: SimTime::from_secs(2.0),
                src: Ipv4Addr::new(10, 1, 1, 2),
                dst: Ipv4Addr::new(10, 1, 1, 1),
                head: vec![0, 0, 0, 7],
            },
        }
    }

    fn collision() -> TraceEvent {
        TraceEvent {
            time: SimTime::from_nanos(2_000_092_000),
            kind: TraceKind::Drop {
                channel: Some(ChannelId(2)),
                node: NodeId(3),
                device: Some(DeviceId(4)),
                frame: Some(FrameId(1)),
                bytes: 1070,
                anomaly: DeliveryAnomaly::Collision,
            },
        }
    }

    #[test]
    fn test_ascii_lines() {
        assert_eq!(
            ascii_line(&transmit()).unwrap(),
            "+ 2.000000000 /NodeList/1/DeviceList/2/Channel/0 1054 10.1.1.2 > 10.1.1.1"
        );
        assert_eq!(
            ascii_line(&collision()).unwrap(),
            "d 2.000092000 /NodeList/3/DeviceList/4/Channel/2 1070 collision"
        );
    }

    #[test]
    fn test_json_sink_hex_head_and_names() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = TraceRecorder::new().with_sink(Box::new(JsonSink::new(Box::new(SharedBuf(buf.clone())))));
        recorder.set_node_names(vec!["p2p[0]".into(), "p2p[1]".into()]);
        recorder.record(&[transmit()]).unwrap();
        recorder.flush().unwrap();

        let text = String::from_utf8(buf.lock().clone()).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["event"], "transmit");
        assert_eq!(parsed[0]["head"], "00000007");
        assert_eq!(parsed[0]["node_name"], "p2p[1]");
        assert_eq!(parsed[0]["time_s"], 2.0);
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        let handle = sink.handle();
        let mut recorder = TraceRecorder::new().with_sink(Box::new(sink));
        assert!(recorder.is_enabled());
        recorder.record(&[transmit(), collision()]).unwrap();
        let events = handle.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].kind, TraceKind::Drop { .. }));
    }
}
