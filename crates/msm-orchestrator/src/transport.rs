// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction.
//!
//! The publish/subscribe transport itself lives outside this crate. The
//! orchestrator only needs to publish a command on one probe's command
//! channel, and to be handed inbound messages already split into their
//! three classes (status, result, error).
//!
//! # Integration
//!
//! ```ignore
//! impl ProbeTransport for MqttAdapter {
//!     fn publish(&self, probe: &ProbeId, payload: &str) -> Result<(), TransportError> {
//!         self.client.publish(format!("probes/{}/commands", probe), payload)
//!     }
//! }
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::measurement::ProbeId;
use crate::protocol::{decode_command, Command, HandlerTag};

/// Transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("publish to probe {probe} failed: {reason}")]
    PublishFailed { probe: ProbeId, reason: String },

    #[error("transport closed")]
    Closed,
}

/// Outbound side of the transport.
pub trait ProbeTransport: Send + Sync {
    /// Publish a payload on the command channel of exactly one probe.
    ///
    /// Delivery is fire-and-forget: `Ok` only means the message was handed
    /// to the transport.
    fn publish(&self, probe: &ProbeId, payload: &str) -> Result<(), TransportError>;
}

/// Inbound message as delivered by the transport adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Status { probe: ProbeId, payload: String },
    Result { probe: ProbeId, payload: String },
    Error { probe: ProbeId, payload: String },
}

impl InboundMessage {
    pub fn status(probe: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Status {
            probe: ProbeId::new(probe),
            payload: payload.into(),
        }
    }

    pub fn result(probe: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Result {
            probe: ProbeId::new(probe),
            payload: payload.into(),
        }
    }

    pub fn error(probe: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Error {
            probe: ProbeId::new(probe),
            payload: payload.into(),
        }
    }

    pub fn probe(&self) -> &ProbeId {
        match self {
            Self::Status { probe, .. } | Self::Result { probe, .. } | Self::Error { probe, .. } => {
                probe
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// A command captured by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub probe: ProbeId,
    pub raw: String,
    /// Decoded form, `None` if the payload was not a valid command.
    pub decoded: Option<(HandlerTag, Command)>,
}

impl Published {
    pub fn command(&self) -> Option<&Command> {
        self.decoded.as_ref().map(|(_, c)| c)
    }

    pub fn command_name(&self) -> Option<&'static str> {
        self.command().map(Command::name)
    }
}

/// Mock transport that records every publish.
pub struct MockTransport {
    log: Mutex<Vec<Published>>,
    tx: mpsc::UnboundedSender<Published>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Published>>,
    failing: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            log: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            failing: Mutex::new(false),
        }
    }

    /// Make subsequent publishes fail.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<Published> {
        self.log.lock().clone()
    }

    /// Number of publishes whose command matches `name`.
    pub fn count(&self, name: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|p| p.command_name() == Some(name))
            .count()
    }

    /// Wait for the next publish.
    pub async fn next(&self) -> Option<Published> {
        self.rx.lock().await.recv().await
    }

    /// Wait for the next publish, giving up after `timeout`.
    pub async fn next_within(&self, timeout: Duration) -> Option<Published> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }

    /// Take the next publish if one is already queued.
    pub fn try_next(&self) -> Option<Published> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeTransport for MockTransport {
    fn publish(&self, probe: &ProbeId, payload: &str) -> Result<(), TransportError> {
        if *self.failing.lock() {
            return Err(TransportError::PublishFailed {
                probe: probe.clone(),
                reason: "mock transport set to fail".into(),
            });
        }
        let published = Published {
            probe: probe.clone(),
            raw: payload.to_string(),
            decoded: decode_command(payload).ok(),
        };
        tracing::debug!("MockTransport: publish to {}: {}", probe, payload);
        self.log.lock().push(published.clone());
        let _ = self.tx.send(published);
        Ok(())
    }
}

// ============================================================================
// In-process bus
// ============================================================================

/// In-process bus with one command channel per attached probe.
///
/// Commands for a probe that is not attached are dropped, as they would be
/// on a broker with no subscriber on that topic.
#[derive(Default)]
pub struct LoopbackBus {
    probes: DashMap<ProbeId, mpsc::UnboundedSender<String>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a probe's command channel.
    pub fn attach(&self, probe: ProbeId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.probes.insert(probe, tx);
        rx
    }

    pub fn detach(&self, probe: &ProbeId) {
        self.probes.remove(probe);
    }

    pub fn is_attached(&self, probe: &ProbeId) -> bool {
        self.probes.contains_key(probe)
    }
}

impl ProbeTransport for LoopbackBus {
    fn publish(&self, probe: &ProbeId, payload: &str) -> Result<(), TransportError> {
        let Some(tx) = self.probes.get(probe) else {
            tracing::debug!("LoopbackBus: no subscriber for probe {}, dropping", probe);
            return Ok(());
        };
        if tx.send(payload.to_string()).is_err() {
            drop(tx);
            self.probes.remove(probe);
            tracing::debug!("LoopbackBus: probe {} went away, dropping", probe);
        }
        Ok(())
    }
}
