// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire envelopes exchanged with probes.
//!
//! Every message is a JSON object `{"handler", "command" | "type", "payload"}`.
//! Outbound commands are a single tagged enum ([`Command`]); inbound status,
//! result and error messages are decoded here into typed values so handlers
//! never probe raw JSON for optional keys.
//!
//! # Examples
//!
//! ```text
//! -> {"handler":"throughput","command":"conf","payload":{"msm_id":"..","role":"server"}}
//! <- {"handler":"throughput","type":"ACK","payload":{"msm_id":"..","command":"conf","port":5201}}
//! <- {"handler":"probe","type":"ONLINE","payload":{"address":"10.0.0.2","clock_sync_address":"10.0.1.2"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::measurement::{MeasurementId, MeasurementKind, MeasurementParams, ThroughputParams};
use crate::report::ResultData;

/// Envelope decoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("unexpected handler '{0}' for this message class")]
    UnexpectedHandler(HandlerTag),
}

/// Destination handler of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerTag {
    /// Probe directory traffic (address requests and announcements).
    Probe,
    /// One of the measurement coordinators.
    Measurement(MeasurementKind),
}

impl HandlerTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Measurement(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for HandlerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerTag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "probe" {
            return Ok(Self::Probe);
        }
        s.parse::<MeasurementKind>()
            .map(Self::Measurement)
            .map_err(|_| ProtocolError::UnknownHandler(s.to_string()))
    }
}

impl From<MeasurementKind> for HandlerTag {
    fn from(kind: MeasurementKind) -> Self {
        Self::Measurement(kind)
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// Role a probe plays in a two-probe measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdPayload {
    pub msm_id: MeasurementId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfPayload {
    pub msm_id: MeasurementId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ThroughputParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub msm_id: MeasurementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MeasurementParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtpPayload {
    pub msm_id: MeasurementId,
    pub role: Role,
    pub socket_port: u16,
    /// Address the client sends its packets to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_address: Option<IpAddr>,
    /// Peer the client synchronizes its clock against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_server: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressPayload {
    pub address: String,
}

/// Commands sent from the coordinator to one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    Conf(ConfPayload),
    Start(StartPayload),
    Stop(IdPayload),
    DisableNtpService(NtpPayload),
    EnableNtpService(IdPayload),
    /// Sensor presence diagnostic (energy); carries no measurement id.
    Check,
    /// Ask a probe to re-announce its addresses.
    GetAddress,
    /// Tell a probe where the coordinator lives. No reply expected.
    CoordinatorAddress(AddressPayload),
}

impl Command {
    pub fn stop(msm_id: MeasurementId) -> Self {
        Self::Stop(IdPayload { msm_id })
    }

    pub fn enable_ntp(msm_id: MeasurementId) -> Self {
        Self::EnableNtpService(IdPayload { msm_id })
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conf(_) => "conf",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::DisableNtpService(_) => "disable_ntp_service",
            Self::EnableNtpService(_) => "enable_ntp_service",
            Self::Check => "check",
            Self::GetAddress => "get_address",
            Self::CoordinatorAddress(_) => "coordinator_address",
        }
    }

    /// Measurement the command belongs to, if any.
    pub fn msm_id(&self) -> Option<MeasurementId> {
        match self {
            Self::Conf(p) => Some(p.msm_id),
            Self::Start(p) => Some(p.msm_id),
            Self::Stop(p) | Self::EnableNtpService(p) => Some(p.msm_id),
            Self::DisableNtpService(p) => Some(p.msm_id),
            Self::Check | Self::GetAddress | Self::CoordinatorAddress(_) => None,
        }
    }
}

/// Encode a command for a handler into its wire form.
pub fn encode_command(handler: HandlerTag, command: &Command) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(command)?;
    if let Value::Object(map) = &mut value {
        map.insert("handler".into(), Value::String(handler.as_str().into()));
        if !map.contains_key("payload") {
            map.insert("payload".into(), Value::Object(Map::new()));
        }
    }
    Ok(serde_json::to_string(&value)?)
}

/// Decode a command (probe side).
pub fn decode_command(raw: &str) -> Result<(HandlerTag, Command), ProtocolError> {
    let mut map: Map<String, Value> = serde_json::from_str(raw)?;
    let handler = take_handler(&mut map)?;
    // Unit commands carry an empty payload object.
    if map.get("payload").is_some_and(|p| p.as_object().is_some_and(Map::is_empty)) {
        map.remove("payload");
    }
    let command: Command = serde_json::from_value(Value::Object(map))?;
    Ok((handler, command))
}

fn take_handler(map: &mut Map<String, Value>) -> Result<HandlerTag, ProtocolError> {
    match map.remove("handler") {
        Some(Value::String(tag)) => tag.parse(),
        _ => Err(ProtocolError::MissingField("handler")),
    }
}

// ============================================================================
// Inbound messages
// ============================================================================

/// Raw inbound envelope, shared by the three message classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub handler: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(handler: HandlerTag, message_type: &str, payload: Value) -> Self {
        Self {
            handler: handler.as_str().to_string(),
            message_type: Some(message_type.to_string()),
            payload,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> String {
        // Envelope only holds JSON values and strings.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn handler_tag(&self) -> Result<HandlerTag, ProtocolError> {
        self.handler.parse()
    }
}

/// Acknowledgement type carried in `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckType {
    Ack,
    Nack,
    Other(String),
}

impl From<&str> for AckType {
    fn from(s: &str) -> Self {
        match s {
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Body of an ACK/NACK.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReply {
    #[serde(default)]
    pub msm_id: Option<MeasurementId>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Port bound by a throughput server.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded status message for a measurement coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub kind: MeasurementKind,
    pub ack: AckType,
    pub reply: StatusReply,
}

/// Addresses announced by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAnnouncement {
    pub address: IpAddr,
    pub clock_sync_address: IpAddr,
}

/// A decoded status message for the probe directory.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    Online(ProbeAnnouncement),
    Update(ProbeAnnouncement),
    Offline,
    Other(String),
}

/// Inbound status, already split between directory and coordinator traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundStatus {
    Probe(ProbeStatus),
    Measurement(StatusMessage),
}

/// Decode a status-class message.
pub fn decode_status(raw: &str) -> Result<InboundStatus, ProtocolError> {
    let envelope = Envelope::parse(raw)?;
    let message_type = envelope
        .message_type
        .clone()
        .ok_or(ProtocolError::MissingField("type"))?;
    match envelope.handler_tag()? {
        HandlerTag::Probe => {
            let status = match message_type.as_str() {
                "ONLINE" => ProbeStatus::Online(serde_json::from_value(envelope.payload)?),
                "UPDATE" => ProbeStatus::Update(serde_json::from_value(envelope.payload)?),
                "OFFLINE" => ProbeStatus::Offline,
                other => ProbeStatus::Other(other.to_string()),
            };
            Ok(InboundStatus::Probe(status))
        }
        HandlerTag::Measurement(kind) => {
            let reply: StatusReply = if envelope.payload.is_null() {
                StatusReply::default()
            } else {
                serde_json::from_value(envelope.payload)?
            };
            Ok(InboundStatus::Measurement(StatusMessage {
                kind,
                ack: AckType::from(message_type.as_str()),
                reply,
            }))
        }
    }
}

/// A decoded result message.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    pub kind: MeasurementKind,
    pub msm_id: Option<MeasurementId>,
    /// Explicit "last repetition" flag of repetition-based kinds.
    pub last: bool,
    pub data: ResultData,
}

/// Decode a result-class message. The body is decoded by the handler's kind.
pub fn decode_result(raw: &str) -> Result<ResultMessage, ProtocolError> {
    let envelope = Envelope::parse(raw)?;
    let kind = match envelope.handler_tag()? {
        HandlerTag::Measurement(kind) => kind,
        tag @ HandlerTag::Probe => return Err(ProtocolError::UnexpectedHandler(tag)),
    };
    let mut body = match envelope.payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(ProtocolError::MissingField("payload")),
    };
    let msm_id = match body.remove("msm_id") {
        Some(Value::Null) | None => None,
        Some(v) => Some(serde_json::from_value(v)?),
    };
    let last = body
        .remove("last")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let data = ResultData::decode(kind, Value::Object(body))?;
    Ok(ResultMessage {
        kind,
        msm_id,
        last,
        data,
    })
}

/// Out-of-band error report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub msm_id: Option<MeasurementId>,
    #[serde(default)]
    pub reason: String,
}

/// Decode an error-class message.
pub fn decode_error(raw: &str) -> Result<(MeasurementKind, ErrorReport), ProtocolError> {
    let envelope = Envelope::parse(raw)?;
    match envelope.handler_tag()? {
        HandlerTag::Measurement(kind) => {
            let report = if envelope.payload.is_null() {
                ErrorReport::default()
            } else {
                serde_json::from_value(envelope.payload)?
            };
            Ok((kind, report))
        }
        tag @ HandlerTag::Probe => Err(ProtocolError::UnexpectedHandler(tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_conf_command() {
        let id = MeasurementId::new();
        let cmd = Command::Conf(ConfPayload {
            msm_id: id,
            role: Role::Server,
            server_address: None,
            port: None,
            parameters: None,
        });
        let raw = encode_command(MeasurementKind::Throughput.into(), &cmd).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["handler"], "throughput");
        assert_eq!(value["command"], "conf");
        assert_eq!(value["payload"]["msm_id"], id.to_string());
        assert_eq!(value["payload"]["role"], "server");
        assert!(value["payload"].get("port").is_none());
    }

    #[test]
    fn test_unit_command_has_empty_payload() {
        let raw = encode_command(MeasurementKind::Energy.into(), &Command::Check).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["command"], "check");
        assert_eq!(value["payload"], json!({}));

        let (handler, cmd) = decode_command(&raw).unwrap();
        assert_eq!(handler, HandlerTag::Measurement(MeasurementKind::Energy));
        assert_eq!(cmd, Command::Check);
    }

    #[test]
    fn test_decode_command_with_payload() {
        let id = MeasurementId::new();
        let raw = encode_command(HandlerTag::Measurement(MeasurementKind::UdpLatency), &Command::stop(id))
            .unwrap();
        let (_, cmd) = decode_command(&raw).unwrap();
        assert_eq!(cmd.msm_id(), Some(id));
        assert_eq!(cmd.name(), "stop");
    }

    #[test]
    fn test_decode_ack_with_port() {
        let id = MeasurementId::new();
        let raw = json!({
            "handler": "throughput",
            "type": "ACK",
            "payload": {"msm_id": id.to_string(), "command": "conf", "port": 5201}
        })
        .to_string();
        match decode_status(&raw).unwrap() {
            InboundStatus::Measurement(msg) => {
                assert_eq!(msg.kind, MeasurementKind::Throughput);
                assert_eq!(msg.ack, AckType::Ack);
                assert_eq!(msg.reply.msm_id, Some(id));
                assert_eq!(msg.reply.port, Some(5201));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_probe_announcement() {
        let raw = json!({
            "handler": "probe",
            "type": "ONLINE",
            "payload": {"address": "10.0.0.2", "clock_sync_address": "10.0.1.2"}
        })
        .to_string();
        match decode_status(&raw).unwrap() {
            InboundStatus::Probe(ProbeStatus::Online(a)) => {
                assert_eq!(a.address.to_string(), "10.0.0.2");
                assert_eq!(a.clock_sync_address.to_string(), "10.0.1.2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_rejects_garbage() {
        assert!(decode_status("not json").is_err());
        assert!(decode_status(r#"{"handler":"nope","type":"ACK"}"#).is_err());
        assert!(decode_status(r#"{"handler":"latency"}"#).is_err());
        assert!(decode_status(r#"{"handler":"latency","type":"ACK","payload":{"msm_id":"xyz"}}"#).is_err());
    }

    #[test]
    fn test_decode_result_extracts_id_and_last_flag() {
        let id = MeasurementId::new();
        let raw = json!({
            "handler": "throughput",
            "type": "result",
            "payload": {"msm_id": id.to_string(), "last": true, "repetition": 2, "bits_per_second": 1.0e9}
        })
        .to_string();
        let msg = decode_result(&raw).unwrap();
        assert_eq!(msg.msm_id, Some(id));
        assert!(msg.last);
        assert_eq!(msg.data.kind(), MeasurementKind::Throughput);
    }

    #[test]
    fn test_decode_result_without_id() {
        let raw = json!({"handler": "latency", "type": "result", "payload": {"packets_transmitted": 3}})
            .to_string();
        let msg = decode_result(&raw).unwrap();
        assert!(msg.msm_id.is_none());
        assert!(!msg.last);
    }

    #[test]
    fn test_decode_error_report() {
        let raw = json!({"handler": "energy", "type": "error", "payload": {"reason": "INA219 not found"}})
            .to_string();
        let (kind, report) = decode_error(&raw).unwrap();
        assert_eq!(kind, MeasurementKind::Energy);
        assert_eq!(report.reason, "INA219 not found");
        assert!(report.msm_id.is_none());
    }
}
