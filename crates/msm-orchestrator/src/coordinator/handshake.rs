// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One handshake run: ordered command/await steps under a single
//! measurement id, plus the compensating commands owed for every step that
//! already succeeded.

use std::net::IpAddr;

use super::Context;
use crate::correlation::{CorrelationRegistry, Outcome};
use crate::directory::AddressKind;
use crate::error::CoordError;
use crate::measurement::{MeasurementId, MeasurementKind, ProbeId};
use crate::protocol::{encode_command, Command, StatusReply};

/// Substring a probe puts in its NACK reason when the id it was sent is not
/// the measurement it is running.
pub const MISMATCH_MARKER: &str = "MISMATCH";

pub struct Handshake<'a> {
    ctx: &'a Context,
    waiters: &'a CorrelationRegistry<MeasurementId, StatusReply>,
    kind: MeasurementKind,
    id: MeasurementId,
    /// Undo commands for configured probes, in configuration order.
    undo: Vec<(ProbeId, Command)>,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(
        ctx: &'a Context,
        waiters: &'a CorrelationRegistry<MeasurementId, StatusReply>,
        kind: MeasurementKind,
        id: MeasurementId,
    ) -> Self {
        Self {
            ctx,
            waiters,
            kind,
            id,
            undo: Vec::new(),
        }
    }

    pub fn id(&self) -> MeasurementId {
        self.id
    }

    pub async fn resolve(&self, probe: &ProbeId, which: AddressKind) -> Result<IpAddr, CoordError> {
        self.ctx.directory.resolve(probe, which).await
    }

    /// Publish `command` to `probe` and wait for its ACK/NACK.
    pub async fn step(&self, probe: &ProbeId, command: Command) -> Result<StatusReply, CoordError> {
        let name = command.name();
        let raw = encode_command(self.kind.into(), &command)
            .map_err(|e| CoordError::Transport(e.to_string()))?;

        // Register before publishing so a fast reply cannot be missed.
        let waiter = self.waiters.register(self.id);
        self.ctx.transport.publish(probe, &raw)?;
        tracing::debug!("[{}] {} -> {}: {}", self.id, name, probe, raw);

        match waiter.wait(self.ctx.timeout).await {
            Outcome::Success(reply) => {
                tracing::debug!("[{}] {} acknowledged by {}", self.id, name, probe);
                Ok(reply)
            }
            Outcome::Failure(reason) => {
                tracing::warn!("[{}] {} rejected by {}: {}", self.id, name, probe, reason);
                if is_teardown(&command) && reason.contains(MISMATCH_MARKER) {
                    return Err(CoordError::Mismatch {
                        probe: probe.clone(),
                        reason,
                    });
                }
                Err(CoordError::Rejected {
                    probe: probe.clone(),
                    command: name.to_string(),
                    reason,
                })
            }
            Outcome::NoReply => {
                tracing::warn!("[{}] {} to {}: no reply", self.id, name, probe);
                Err(CoordError::Timeout {
                    probe: probe.clone(),
                    command: name.to_string(),
                    timeout_ms: self.ctx.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Record that `probe` is configured and must receive `undo` if a later
    /// step fails.
    pub fn configured(&mut self, probe: &ProbeId, undo: Command) {
        self.undo.push((probe.clone(), undo));
    }

    /// Publish without waiting for a reply.
    pub fn send(&self, probe: &ProbeId, command: &Command) {
        send(self.ctx, self.kind, probe, command);
    }

    /// Issue the undo commands of every configured probe, newest first.
    /// Best effort: failures are logged.
    pub(crate) fn compensate(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        tracing::info!(
            "[{}] compensating {} configured probe(s)",
            self.id,
            self.undo.len()
        );
        while let Some((probe, command)) = self.undo.pop() {
            self.send(&probe, &command);
        }
    }
}

/// Publish one command without a correlation wait, logging failures.
pub(crate) fn send(ctx: &Context, kind: MeasurementKind, probe: &ProbeId, command: &Command) {
    let sent = encode_command(kind.into(), command)
        .map_err(|e| e.to_string())
        .and_then(|raw| ctx.transport.publish(probe, &raw).map_err(|e| e.to_string()));
    match sent {
        Ok(()) => tracing::debug!("{} -> {} (no reply expected)", command.name(), probe),
        Err(e) => tracing::warn!("Could not send {} to {}: {}", command.name(), probe, e),
    }
}

fn is_teardown(command: &Command) -> bool {
    matches!(
        command,
        Command::Stop(_) | Command::EnableNtpService(_) | Command::DisableNtpService(_)
    )
}
