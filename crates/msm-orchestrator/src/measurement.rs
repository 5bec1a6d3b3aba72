// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement data model.
//!
//! A [`Measurement`] is created `Queued` with its id already assigned, becomes
//! `Started` once its handshake succeeded and it was persisted, and ends in
//! exactly one terminal state (`Completed` or `Failed`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoordError;
use crate::report::ResultId;

/// Correlation id of a measurement.
///
/// Generated once, before any message referencing it is published, and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(Uuid);

impl MeasurementId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MeasurementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MeasurementId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Logical id of a probe (the name its topics are derived from).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeId(String);

impl ProbeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProbeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The six measurement kinds. Each one is driven by exactly one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Throughput,
    Latency,
    Energy,
    AgeOfInformation,
    UdpLatency,
    Coexistence,
}

impl MeasurementKind {
    /// All kinds, in registry order.
    pub const ALL: [MeasurementKind; 6] = [
        Self::Throughput,
        Self::Latency,
        Self::Energy,
        Self::AgeOfInformation,
        Self::UdpLatency,
        Self::Coexistence,
    ];

    /// Slot of this kind in per-kind tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Throughput => 0,
            Self::Latency => 1,
            Self::Energy => 2,
            Self::AgeOfInformation => 3,
            Self::UdpLatency => 4,
            Self::Coexistence => 5,
        }
    }

    /// Handler tag used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Throughput => "throughput",
            Self::Latency => "latency",
            Self::Energy => "energy",
            Self::AgeOfInformation => "age_of_information",
            Self::UdpLatency => "udp_latency",
            Self::Coexistence => "coexistence",
        }
    }

    /// Whether a second probe takes part in the measurement.
    pub const fn needs_destination(self) -> bool {
        !matches!(self, Self::Energy)
    }

    /// Repetition-based kinds emit several results and flag the last one.
    pub const fn is_repeated(self) -> bool {
        matches!(self, Self::Throughput)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoordError::UnknownKind(s.to_string()))
    }
}

/// Lifecycle state of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementState {
    Queued,
    Started,
    Completed,
    Failed,
}

impl MeasurementState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transitions are monotonic: queued -> started -> {completed, failed},
    /// and a queued measurement may fail before it was ever started.
    pub const fn can_transition_to(self, next: MeasurementState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Started)
                | (Self::Queued, Self::Failed)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Kind-specific parameters
// ============================================================================

/// Transport protocol of a throughput run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputParams {
    pub transport: TransportProtocol,
    pub duration_secs: u32,
    pub parallel_streams: u32,
    pub reverse: bool,
    /// Number of back-to-back runs; each one reports its own result.
    pub repetitions: u32,
    /// Target bitrate for UDP runs (None = tool default).
    pub bitrate_bps: Option<u64>,
}

impl Default for ThroughputParams {
    fn default() -> Self {
        Self {
            transport: TransportProtocol::Tcp,
            duration_secs: 10,
            parallel_streams: 1,
            reverse: false,
            repetitions: 1,
            bitrate_bps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyParams {
    pub packets: u32,
    pub packet_size: u32,
    pub interval_ms: u32,
}

impl Default for LatencyParams {
    fn default() -> Self {
        Self {
            packets: 10,
            packet_size: 56,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyParams {
    pub duration_secs: u32,
    pub sampling_interval_ms: u32,
}

impl Default for EnergyParams {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            sampling_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AoiParams {
    pub socket_port: u16,
    pub packets_rate_hz: u32,
    pub payload_size: u32,
    pub duration_secs: u32,
}

impl Default for AoiParams {
    fn default() -> Self {
        Self {
            socket_port: 50505,
            packets_rate_hz: 10,
            payload_size: 32,
            duration_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpLatencyParams {
    pub socket_port: u16,
    pub packets: u32,
    pub packet_size: u32,
    pub interval_ms: u32,
}

impl Default for UdpLatencyParams {
    fn default() -> Self {
        Self {
            socket_port: 50506,
            packets: 100,
            packet_size: 64,
            interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoexistenceParams {
    pub socket_port: u16,
    pub packets_size: u32,
    pub packets_rate_hz: u32,
    pub duration_secs: u32,
    pub delay_start_secs: u32,
}

impl Default for CoexistenceParams {
    fn default() -> Self {
        Self {
            socket_port: 50507,
            packets_size: 512,
            packets_rate_hz: 100,
            duration_secs: 30,
            delay_start_secs: 0,
        }
    }
}

/// Kind-tagged measurement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementParams {
    Throughput(ThroughputParams),
    Latency(LatencyParams),
    Energy(EnergyParams),
    AgeOfInformation(AoiParams),
    UdpLatency(UdpLatencyParams),
    Coexistence(CoexistenceParams),
}

impl MeasurementParams {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Self::Throughput(_) => MeasurementKind::Throughput,
            Self::Latency(_) => MeasurementKind::Latency,
            Self::Energy(_) => MeasurementKind::Energy,
            Self::AgeOfInformation(_) => MeasurementKind::AgeOfInformation,
            Self::UdpLatency(_) => MeasurementKind::UdpLatency,
            Self::Coexistence(_) => MeasurementKind::Coexistence,
        }
    }

    /// Default parameters for a kind.
    pub fn default_for(kind: MeasurementKind) -> Self {
        match kind {
            MeasurementKind::Throughput => Self::Throughput(ThroughputParams::default()),
            MeasurementKind::Latency => Self::Latency(LatencyParams::default()),
            MeasurementKind::Energy => Self::Energy(EnergyParams::default()),
            MeasurementKind::AgeOfInformation => Self::AgeOfInformation(AoiParams::default()),
            MeasurementKind::UdpLatency => Self::UdpLatency(UdpLatencyParams::default()),
            MeasurementKind::Coexistence => Self::Coexistence(CoexistenceParams::default()),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Throughput(p) => {
                if p.repetitions == 0 {
                    return Err("throughput repetitions must be at least 1".into());
                }
                if p.parallel_streams == 0 {
                    return Err("throughput parallel_streams must be at least 1".into());
                }
            }
            Self::AgeOfInformation(p) if p.packets_rate_hz == 0 => {
                return Err("age_of_information packets_rate_hz must be positive".into());
            }
            Self::UdpLatency(p) if p.packets == 0 => {
                return Err("udp_latency packets must be positive".into());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Ingress descriptor of a measurement to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRequest {
    pub source_probe: ProbeId,
    #[serde(default)]
    pub destination_probe: Option<ProbeId>,
    pub parameters: MeasurementParams,
}

impl MeasurementRequest {
    pub fn new(source: impl Into<String>, parameters: MeasurementParams) -> Self {
        Self {
            source_probe: ProbeId::new(source),
            destination_probe: None,
            parameters,
        }
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination_probe = Some(ProbeId::new(destination));
        self
    }

    pub fn kind(&self) -> MeasurementKind {
        self.parameters.kind()
    }

    /// Check the probe pairing and the kind-specific parameters.
    pub fn validate(&self) -> Result<(), CoordError> {
        let kind = self.kind();
        match (&self.destination_probe, kind.needs_destination()) {
            (None, true) => {
                return Err(CoordError::InvalidRequest(format!(
                    "{} measurement needs a destination probe",
                    kind
                )))
            }
            (Some(dst), _) if *dst == self.source_probe => {
                return Err(CoordError::InvalidRequest(format!(
                    "source and destination are the same probe ({})",
                    dst
                )))
            }
            _ => {}
        }
        self.parameters.validate().map_err(CoordError::InvalidRequest)
    }
}

/// A measurement campaign between one or two probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: MeasurementId,
    pub source_probe: ProbeId,
    pub destination_probe: Option<ProbeId>,
    pub source_address: Option<IpAddr>,
    pub destination_address: Option<IpAddr>,
    pub parameters: MeasurementParams,
    pub state: MeasurementState,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<ResultId>,
}

impl Measurement {
    /// Turn a request into a queued measurement, assigning its id.
    pub fn queued(request: MeasurementRequest) -> Self {
        Self {
            id: MeasurementId::new(),
            source_probe: request.source_probe,
            destination_probe: request.destination_probe,
            source_address: None,
            destination_address: None,
            parameters: request.parameters,
            state: MeasurementState::Queued,
            start_time: Utc::now(),
            stop_time: None,
            results: Vec::new(),
        }
    }

    pub fn kind(&self) -> MeasurementKind {
        self.parameters.kind()
    }

    /// Destination probe id; only absent for single-probe kinds.
    pub fn destination(&self) -> Result<&ProbeId, CoordError> {
        self.destination_probe.as_ref().ok_or_else(|| {
            CoordError::InvalidRequest(format!("measurement {} has no destination probe", self.id))
        })
    }

    /// Apply a lifecycle transition. Returns false if it is not allowed.
    pub fn transition(&mut self, next: MeasurementState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.stop_time = Some(Utc::now());
        }
        true
    }
}
