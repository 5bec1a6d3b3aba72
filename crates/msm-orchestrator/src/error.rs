// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coordinator error taxonomy and the ingress response triad.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::measurement::{MeasurementId, ProbeId};

/// Errors produced by coordinator operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordError {
    #[error("probe {probe} did not answer '{command}' within {timeout_ms} ms")]
    Timeout {
        probe: ProbeId,
        command: String,
        timeout_ms: u64,
    },

    #[error("probe {probe} rejected '{command}': {reason}")]
    Rejected {
        probe: ProbeId,
        command: String,
        reason: String,
    },

    #[error("probe {probe} is running a different measurement: {reason}")]
    Mismatch { probe: ProbeId, reason: String },

    #[error("no coordinator registered for measurement kind '{0}'")]
    UnknownKind(String),

    #[error("measurement {0} is not tracked")]
    UnknownId(String),

    #[error("address of probe {0} could not be resolved")]
    ProbeNotFound(ProbeId),

    #[error("measurement {0} already completed")]
    AlreadyCompleted(MeasurementId),

    #[error("measurement {0} already failed")]
    AlreadyFailed(MeasurementId),

    #[error("measurement {0} was never started")]
    NotStarted(MeasurementId),

    #[error("handshake succeeded, but measurement {id} could not be recorded: {reason}")]
    Persistence { id: MeasurementId, reason: String },

    #[error("measurement store unavailable: {0}")]
    Store(String),

    #[error("invalid measurement request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CoordError {
    /// Taxonomy label reported as the triad's cause.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Timeout",
            Self::Rejected { .. } => "Rejection",
            Self::Mismatch { .. } => "Mismatch",
            Self::UnknownKind(_) => "UnknownKind",
            Self::UnknownId(_) | Self::ProbeNotFound(_) => "UnknownId",
            Self::AlreadyCompleted(_) | Self::AlreadyFailed(_) | Self::NotStarted(_) => {
                "InvalidState"
            }
            Self::Persistence { .. } | Self::Store(_) => "PersistenceFailure",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Transport(_) => "Transport",
        }
    }
}

impl From<crate::transport::TransportError> for CoordError {
    fn from(e: crate::transport::TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Status tag of a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Error")]
    Error,
}

/// Uniform `(status, body, cause)` outcome handed to the ingress boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    /// Serialized measurement on success, or a human-readable message.
    pub body: serde_json::Value,
    pub cause: Option<String>,
}

impl Response {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: Status::Ok,
            body,
            cause: None,
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self::ok(serde_json::Value::String(msg.into()))
    }

    pub fn error(err: &CoordError) -> Self {
        Self {
            status: Status::Error,
            body: serde_json::Value::String(err.to_string()),
            cause: Some(err.cause().to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Message text of the body, if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.body.as_str()
    }
}

impl<T: Serialize> From<Result<T, CoordError>> for Response {
    fn from(result: Result<T, CoordError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(body) => Self::ok(body),
                Err(e) => Self {
                    status: Status::Error,
                    body: serde_json::Value::String(format!("could not serialize reply: {}", e)),
                    cause: Some("Serialization".to_string()),
                },
            },
            Err(err) => Self::error(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_triad_carries_reason() {
        let err = CoordError::Rejected {
            probe: ProbeId::new("P2"),
            command: "disable_ntp_service".into(),
            reason: "SENSOR BUSY".into(),
        };
        let resp = Response::error(&err);
        assert_eq!(resp.status, Status::Error);
        assert!(resp.text().unwrap().contains("SENSOR BUSY"));
        assert_eq!(resp.cause.as_deref(), Some("Rejection"));
    }

    #[test]
    fn test_terminal_state_messages_are_distinct() {
        let id = MeasurementId::new();
        let completed = CoordError::AlreadyCompleted(id).to_string();
        let failed = CoordError::AlreadyFailed(id).to_string();
        assert_ne!(completed, failed);
        assert!(completed.contains("completed"));
        assert!(failed.contains("failed"));
    }

    #[test]
    fn test_response_from_result() {
        let ok: Response = Ok::<_, CoordError>("stopped").into();
        assert!(ok.is_ok());
        assert_eq!(ok.text(), Some("stopped"));

        let err: Response = Err::<(), _>(CoordError::UnknownKind("x".into())).into();
        assert!(!err.is_ok());
        assert_eq!(err.cause.as_deref(), Some("UnknownKind"));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&Status::Ok).unwrap(), "\"OK\"");
        assert_eq!(serde_json::to_string(&Status::Error).unwrap(), "\"Error\"");
    }
}
