// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated probes.
//!
//! A [`SimulatedProbe`] subscribes to its command channel on a
//! [`LoopbackBus`] and answers the way a field probe does: it announces
//! itself ONLINE, ACKs commands, reports the port its throughput server
//! bound, and emits kind-specific results once started. A [`ProbeScript`]
//! makes it reject or ignore chosen commands.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ProbeConfig;
use crate::measurement::{MeasurementId, MeasurementKind, MeasurementParams, ProbeId};
use crate::protocol::{decode_command, Command, Envelope, HandlerTag, Role};
use crate::report::{
    AoiReport, CoexistenceReport, EnergyReport, EnergySample, LatencyReport, ThroughputReport,
    TimedValue, UdpLatencyReport,
};
use crate::transport::{InboundMessage, LoopbackBus};

/// Reason a probe gives when asked to stop a measurement it is not running.
pub const ID_MISMATCH: &str = "ID MISMATCH";

/// Scripted probe behaviour.
#[derive(Debug, Clone)]
pub struct ProbeScript {
    /// Commands to NACK, keyed by wire name, with the reason.
    pub nack: HashMap<String, String>,
    /// Commands never answered.
    pub silent: HashSet<String>,
    /// Port reported by a throughput server.
    pub server_port: u16,
    /// Delay before results are emitted after `start`. `None` never emits.
    pub result_delay: Option<Duration>,
    /// Report this runtime error instead of results.
    pub fail_after_start: Option<String>,
}

impl Default for ProbeScript {
    fn default() -> Self {
        Self {
            nack: HashMap::new(),
            silent: HashSet::new(),
            server_port: 5201,
            result_delay: Some(Duration::from_millis(20)),
            fail_after_start: None,
        }
    }
}

impl ProbeScript {
    pub fn nack(mut self, command: impl Into<String>, reason: impl Into<String>) -> Self {
        self.nack.insert(command.into(), reason.into());
        self
    }

    pub fn silent(mut self, command: impl Into<String>) -> Self {
        self.silent.insert(command.into());
        self
    }

    /// Keep running after `start` until stopped.
    pub fn no_results(mut self) -> Self {
        self.result_delay = None;
        self
    }

    pub fn fail_after_start(mut self, reason: impl Into<String>) -> Self {
        self.fail_after_start = Some(reason.into());
        self
    }
}

/// Measurement a probe is currently part of.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Session {
    id: MeasurementId,
    kind: MeasurementKind,
    repetitions: u32,
}

/// One simulated probe.
pub struct SimulatedProbe {
    id: ProbeId,
    address: IpAddr,
    clock_sync_address: IpAddr,
    script: ProbeScript,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    session: Arc<Mutex<Option<Session>>>,
}

impl SimulatedProbe {
    pub fn new(
        id: impl Into<String>,
        address: IpAddr,
        clock_sync_address: IpAddr,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        Self {
            id: ProbeId::new(id),
            address,
            clock_sync_address,
            script: ProbeScript::default(),
            inbound,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a probe from its configuration entry.
    pub fn from_config(config: &ProbeConfig, inbound: mpsc::UnboundedSender<InboundMessage>) -> Self {
        let mut script = ProbeScript::default();
        for (command, reason) in &config.nack {
            script = script.nack(command.clone(), reason.clone());
        }
        for command in &config.silent {
            script = script.silent(command.clone());
        }
        Self::new(
            config.id.clone(),
            config.address,
            config.clock_sync_address,
            inbound,
        )
        .with_script(script)
    }

    pub fn with_script(mut self, script: ProbeScript) -> Self {
        self.script = script;
        self
    }

    pub fn id(&self) -> &ProbeId {
        &self.id
    }

    /// Attach to the bus, announce ONLINE, and serve commands until the
    /// probe is detached.
    pub fn spawn(self, bus: &LoopbackBus) -> JoinHandle<()> {
        let mut commands = bus.attach(self.id.clone());
        self.announce("ONLINE");
        tokio::spawn(async move {
            while let Some(raw) = commands.recv().await {
                match decode_command(&raw) {
                    Ok((handler, command)) => self.handle(handler, command),
                    Err(e) => tracing::warn!("Probe {}: undecodable command: {}", self.id, e),
                }
            }
            tracing::debug!("Probe {} detached", self.id);
        })
    }

    fn emit(&self, message: InboundMessage) {
        if self.inbound.send(message).is_err() {
            tracing::debug!("Probe {}: orchestrator gone", self.id);
        }
    }

    fn announce(&self, status: &str) {
        let payload = json!({
            "address": self.address,
            "clock_sync_address": self.clock_sync_address,
        });
        let envelope = Envelope::new(HandlerTag::Probe, status, payload);
        self.emit(InboundMessage::status(self.id.as_str(), envelope.to_json()));
    }

    fn handle(&self, handler: HandlerTag, command: Command) {
        let kind = match handler {
            HandlerTag::Probe => {
                match command {
                    Command::GetAddress => self.announce("UPDATE"),
                    Command::CoordinatorAddress(p) => {
                        tracing::debug!("Probe {}: coordinator at {}", self.id, p.address)
                    }
                    other => tracing::warn!("Probe {}: unexpected '{}'", self.id, other.name()),
                }
                return;
            }
            HandlerTag::Measurement(kind) => kind,
        };

        let name = command.name();
        if self.script.silent.contains(name) {
            tracing::debug!("Probe {}: ignoring '{}'", self.id, name);
            return;
        }

        if let Command::Check = command {
            if let Some(reason) = self.script.nack.get(name) {
                self.report_error(kind, None, reason);
            }
            return;
        }

        // Commands other than check always carry an id.
        let Some(id) = command.msm_id() else {
            return;
        };

        if let Some(reason) = self.script.nack.get(name) {
            return self.reply(kind, "NACK", id, name, Some(reason), None);
        }

        match command {
            Command::Conf(p) => {
                let repetitions = p.parameters.map_or(1, |t| t.repetitions.max(1));
                self.open_session(id, kind, repetitions);
                let port = (p.role == Role::Server).then_some(self.script.server_port);
                self.reply(kind, "ACK", id, name, None, port);
            }
            Command::DisableNtpService(_) => {
                self.open_session(id, kind, 1);
                self.reply(kind, "ACK", id, name, None, None);
            }
            Command::Start(p) => {
                let repetitions = match (&p.parameters, *self.session.lock()) {
                    (Some(MeasurementParams::Throughput(t)), _) => t.repetitions.max(1),
                    (_, Some(s)) if s.id == id => s.repetitions,
                    _ => 1,
                };
                self.open_session(id, kind, repetitions);
                self.reply(kind, "ACK", id, name, None, None);
                self.run(Session {
                    id,
                    kind,
                    repetitions,
                });
            }
            Command::Stop(_) => {
                let running = self.session.lock().map(|s| s.id);
                match running {
                    Some(other) if other != id => {
                        self.reply(kind, "NACK", id, name, Some(ID_MISMATCH), None);
                    }
                    _ => {
                        self.close_session(id);
                        self.reply(kind, "ACK", id, name, None, None);
                    }
                }
            }
            Command::EnableNtpService(_) => {
                self.close_session(id);
                self.reply(kind, "ACK", id, name, None, None);
            }
            Command::Check | Command::GetAddress | Command::CoordinatorAddress(_) => {}
        }
    }

    fn open_session(&self, id: MeasurementId, kind: MeasurementKind, repetitions: u32) {
        *self.session.lock() = Some(Session {
            id,
            kind,
            repetitions,
        });
    }

    fn close_session(&self, id: MeasurementId) {
        let mut session = self.session.lock();
        if session.is_some_and(|s| s.id == id) {
            *session = None;
        }
    }

    fn reply(
        &self,
        kind: MeasurementKind,
        ack: &str,
        id: MeasurementId,
        command: &str,
        reason: Option<&str>,
        port: Option<u16>,
    ) {
        let mut payload = Map::new();
        payload.insert("msm_id".into(), json!(id));
        payload.insert("command".into(), json!(command));
        if let Some(reason) = reason {
            payload.insert("reason".into(), json!(reason));
        }
        if let Some(port) = port {
            payload.insert("port".into(), json!(port));
        }
        let envelope = Envelope::new(kind.into(), ack, Value::Object(payload));
        self.emit(InboundMessage::status(self.id.as_str(), envelope.to_json()));
    }

    fn report_error(&self, kind: MeasurementKind, id: Option<MeasurementId>, reason: &str) {
        let envelope = Envelope::new(kind.into(), "error", json!({ "msm_id": id, "reason": reason }));
        self.emit(InboundMessage::error(self.id.as_str(), envelope.to_json()));
    }

    /// Emit results for a started session, unless it is stopped first.
    fn run(&self, session: Session) {
        let Some(delay) = self.script.result_delay else {
            return;
        };
        let probe = self.id.clone();
        let inbound = self.inbound.clone();
        let current = Arc::clone(&self.session);
        let failure = self.script.fail_after_start.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *current.lock() != Some(session) {
                tracing::debug!("Probe {}: [{}] stopped before reporting", probe, session.id);
                return;
            }

            if let Some(reason) = failure {
                let payload = json!({ "msm_id": session.id, "reason": reason });
                let envelope = Envelope::new(session.kind.into(), "error", payload);
                let _ = inbound.send(InboundMessage::error(probe.as_str(), envelope.to_json()));
            } else {
                for repetition in 1..=session.repetitions {
                    let last = repetition == session.repetitions;
                    let payload = result_payload(session.kind, session.id, repetition, last);
                    let envelope = Envelope::new(session.kind.into(), "result", payload);
                    let _ = inbound.send(InboundMessage::result(probe.as_str(), envelope.to_json()));
                }
            }

            let mut guard = current.lock();
            if *guard == Some(session) {
                *guard = None;
            }
        });
    }
}

fn body<T: Serialize>(report: T) -> Map<String, Value> {
    match serde_json::to_value(report) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Plausible result body for one report of a kind.
fn result_payload(kind: MeasurementKind, id: MeasurementId, repetition: u32, last: bool) -> Value {
    let series = |base: f64| -> Vec<TimedValue> {
        (0..5)
            .map(|i| TimedValue {
                timestamp_ms: i * 100,
                value_ms: base + i as f64 * 0.1,
            })
            .collect()
    };

    let mut map = match kind {
        MeasurementKind::Throughput => body(ThroughputReport {
            repetition,
            bits_per_second: 9.41e8,
            bytes_transferred: 1_176_250_000,
            retransmits: Some(0),
            ..Default::default()
        }),
        MeasurementKind::Latency => body(LatencyReport {
            packets_transmitted: 10,
            packets_received: 10,
            packet_loss_percent: 0.0,
            rtt_min_ms: 0.41,
            rtt_avg_ms: 0.52,
            rtt_max_ms: 0.77,
            rtt_mdev_ms: 0.09,
            rtt_samples_ms: vec![0.41, 0.52, 0.77],
        }),
        MeasurementKind::Energy => body(EnergyReport {
            samples: (0..5)
                .map(|i| EnergySample {
                    timestamp_ms: i * 100,
                    current_ma: 410.0,
                    voltage_v: 5.1,
                    power_mw: 2091.0,
                })
                .collect(),
        }),
        MeasurementKind::AgeOfInformation => body(AoiReport {
            aoi_min_ms: 1.2,
            aoi_max_ms: 1.6,
            aoi_mean_ms: 1.4,
            series: series(1.2),
        }),
        MeasurementKind::UdpLatency => body(UdpLatencyReport {
            latency_min_ms: 0.3,
            latency_max_ms: 0.7,
            latency_mean_ms: 0.5,
            packets_lost: 0,
            series: series(0.3),
        }),
        MeasurementKind::Coexistence => body(CoexistenceReport {
            packets_sent: 3000,
            packets_received: 2997,
            packets_lost: 3,
            throughput_bps: 4.1e5,
        }),
    };
    map.insert("msm_id".into(), json!(id));
    map.insert("last".into(), json!(last));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode_error, decode_result, decode_status, encode_command, AckType, IdPayload,
        InboundStatus, ProbeStatus, StartPayload,
    };
    use crate::transport::ProbeTransport;

    fn probe(bus: &LoopbackBus, script: ProbeScript) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        SimulatedProbe::new("P1", "10.0.0.11".parse().unwrap(), "10.0.1.11".parse().unwrap(), tx)
            .with_script(script)
            .spawn(bus);
        rx
    }

    fn send(bus: &LoopbackBus, kind: MeasurementKind, command: &Command) {
        let raw = encode_command(kind.into(), command).unwrap();
        bus.publish(&ProbeId::new("P1"), &raw).unwrap();
    }

    fn status(msg: InboundMessage) -> InboundStatus {
        match msg {
            InboundMessage::Status { payload, .. } => decode_status(&payload).unwrap(),
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announces_and_answers_address_requests() {
        let bus = LoopbackBus::new();
        let mut rx = probe(&bus, ProbeScript::default());

        assert!(matches!(
            status(rx.recv().await.unwrap()),
            InboundStatus::Probe(ProbeStatus::Online(_))
        ));

        let raw = encode_command(HandlerTag::Probe, &Command::GetAddress).unwrap();
        bus.publish(&ProbeId::new("P1"), &raw).unwrap();
        match status(rx.recv().await.unwrap()) {
            InboundStatus::Probe(ProbeStatus::Update(a)) => {
                assert_eq!(a.clock_sync_address.to_string(), "10.0.1.11")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_acks_then_reports() {
        let bus = LoopbackBus::new();
        let mut rx = probe(&bus, ProbeScript::default());
        rx.recv().await.unwrap();

        let id = MeasurementId::new();
        send(
            &bus,
            MeasurementKind::Latency,
            &Command::Start(StartPayload {
                msm_id: id,
                peer_address: None,
                parameters: None,
            }),
        );

        match status(rx.recv().await.unwrap()) {
            InboundStatus::Measurement(m) => {
                assert_eq!(m.reply.msm_id, Some(id));
                assert_eq!(m.reply.command.as_deref(), Some("start"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            InboundMessage::Result { payload, .. } => {
                let result = decode_result(&payload).unwrap();
                assert_eq!(result.msm_id, Some(id));
                assert!(result.last);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_for_other_measurement_is_refused() {
        let bus = LoopbackBus::new();
        let mut rx = probe(&bus, ProbeScript::default().no_results());
        rx.recv().await.unwrap();

        let running = MeasurementId::new();
        send(
            &bus,
            MeasurementKind::Coexistence,
            &Command::Start(StartPayload {
                msm_id: running,
                peer_address: None,
                parameters: None,
            }),
        );
        rx.recv().await.unwrap();

        let other = MeasurementId::new();
        send(&bus, MeasurementKind::Coexistence, &Command::Stop(IdPayload { msm_id: other }));
        match status(rx.recv().await.unwrap()) {
            InboundStatus::Measurement(m) => {
                assert_eq!(m.ack, AckType::Nack);
                assert_eq!(m.reply.reason.as_deref(), Some(ID_MISMATCH));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_check_failure_reports_error() {
        let bus = LoopbackBus::new();
        let mut rx = probe(&bus, ProbeScript::default().nack("check", "INA219 not found"));
        rx.recv().await.unwrap();

        send(&bus, MeasurementKind::Energy, &Command::Check);
        match rx.recv().await.unwrap() {
            InboundMessage::Error { payload, .. } => {
                let (kind, report) = decode_error(&payload).unwrap();
                assert_eq!(kind, MeasurementKind::Energy);
                assert_eq!(report.reason, "INA219 not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_result_payload_decodes_for_every_kind() {
        let id = MeasurementId::new();
        for kind in MeasurementKind::ALL {
            let envelope = Envelope::new(kind.into(), "result", result_payload(kind, id, 1, true));
            let result = decode_result(&envelope.to_json()).unwrap();
            assert_eq!(result.data.kind(), kind);
            assert_eq!(result.msm_id, Some(id));
        }
    }
}
