// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement results.
//!
//! Results are immutable once created. Each one back-references the
//! measurement it belongs to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::measurement::{MeasurementId, MeasurementKind, ProbeId};

/// Id of a stored result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(Uuid);

impl ResultId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One throughput repetition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputReport {
    pub repetition: u32,
    pub bits_per_second: f64,
    pub bytes_transferred: u64,
    pub retransmits: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub lost_percent: Option<f64>,
}

/// Round-trip latency summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyReport {
    pub packets_transmitted: u32,
    pub packets_received: u32,
    pub packet_loss_percent: f64,
    pub rtt_min_ms: f64,
    pub rtt_avg_ms: f64,
    pub rtt_max_ms: f64,
    pub rtt_mdev_ms: f64,
    pub rtt_samples_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergySample {
    pub timestamp_ms: u64,
    pub current_ma: f64,
    pub voltage_v: f64,
    pub power_mw: f64,
}

/// Power draw timeseries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyReport {
    pub samples: Vec<EnergySample>,
}

impl EnergyReport {
    /// Mean power over the series, if any sample was taken.
    pub fn mean_power_mw(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.power_mw).sum();
        Some(total / self.samples.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp_ms: u64,
    pub value_ms: f64,
}

/// Age-of-information summary and series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AoiReport {
    pub aoi_min_ms: f64,
    pub aoi_max_ms: f64,
    pub aoi_mean_ms: f64,
    pub series: Vec<TimedValue>,
}

/// One-way UDP latency summary and series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpLatencyReport {
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_mean_ms: f64,
    pub packets_lost: u32,
    pub series: Vec<TimedValue>,
}

/// Traffic counters of a coexistence run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoexistenceReport {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub throughput_bps: f64,
}

/// Kind-specific result body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultData {
    Throughput(ThroughputReport),
    Latency(LatencyReport),
    Energy(EnergyReport),
    AgeOfInformation(AoiReport),
    UdpLatency(UdpLatencyReport),
    Coexistence(CoexistenceReport),
}

impl ResultData {
    /// Decode an untagged result body for a known kind.
    pub fn decode(kind: MeasurementKind, body: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            MeasurementKind::Throughput => Self::Throughput(serde_json::from_value(body)?),
            MeasurementKind::Latency => Self::Latency(serde_json::from_value(body)?),
            MeasurementKind::Energy => Self::Energy(serde_json::from_value(body)?),
            MeasurementKind::AgeOfInformation => {
                Self::AgeOfInformation(serde_json::from_value(body)?)
            }
            MeasurementKind::UdpLatency => Self::UdpLatency(serde_json::from_value(body)?),
            MeasurementKind::Coexistence => Self::Coexistence(serde_json::from_value(body)?),
        })
    }

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
}

/// A stored result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub id: ResultId,
    pub measurement_id: MeasurementId,
    pub probe: ProbeId,
    pub received_at: DateTime<Utc>,
    pub data: ResultData,
}

impl MeasurementResult {
    pub fn new(measurement_id: MeasurementId, probe: ProbeId, data: ResultData) -> Self {
        Self {
            id: ResultId::new(),
            measurement_id,
            probe,
            received_at: Utc::now(),
            data,
        }
    }
}
