// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock-synchronized handshake (age of information, UDP latency).
//!
//! One-way measurements need both probes on the same clock, so each probe
//! suspends its own time service while the source synchronizes directly
//! against the destination:
//!
//! 1. destination: `disable_ntp_service` as server, opening the socket
//! 2. source: `disable_ntp_service` as client, pointed at the destination's
//!    socket and clock-sync address
//! 3. source: `start`
//!
//! Stopping asks the destination first. A `MISMATCH` reason there means it
//! is running another measurement, and nothing further is sent.

use async_trait::async_trait;

use super::{Handshake, HandshakeShape};
use crate::directory::AddressKind;
use crate::error::CoordError;
use crate::measurement::{Measurement, MeasurementKind, MeasurementParams, ProbeId};
use crate::protocol::{Command, NtpPayload, Role, StartPayload};

pub struct ClockSync {
    kind: MeasurementKind,
}

impl ClockSync {
    pub fn age_of_information() -> Self {
        Self {
            kind: MeasurementKind::AgeOfInformation,
        }
    }

    pub fn udp_latency() -> Self {
        Self {
            kind: MeasurementKind::UdpLatency,
        }
    }
}

fn socket_port(m: &Measurement) -> Result<u16, CoordError> {
    match &m.parameters {
        MeasurementParams::AgeOfInformation(p) => Ok(p.socket_port),
        MeasurementParams::UdpLatency(p) => Ok(p.socket_port),
        other => Err(CoordError::InvalidRequest(format!(
            "{} is not a clock-synchronized measurement",
            other.kind()
        ))),
    }
}

#[async_trait]
impl HandshakeShape for ClockSync {
    fn kind(&self) -> MeasurementKind {
        self.kind
    }

    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
        let socket_port = socket_port(m)?;
        let id = hs.id();
        let src = m.source_probe.clone();
        let dst = m.destination()?.clone();

        let dst_address = hs.resolve(&dst, AddressKind::Primary).await?;
        let dst_clock = hs.resolve(&dst, AddressKind::ClockSync).await?;
        m.source_address = Some(hs.resolve(&src, AddressKind::Primary).await?);
        m.destination_address = Some(dst_address);

        let server = Command::DisableNtpService(NtpPayload {
            msm_id: id,
            role: Role::Server,
            socket_port,
            socket_address: None,
            ntp_server: None,
        });
        hs.step(&dst, server).await?;
        hs.configured(&dst, Command::stop(id));

        let client = Command::DisableNtpService(NtpPayload {
            msm_id: id,
            role: Role::Client,
            socket_port,
            socket_address: Some(dst_address),
            ntp_server: Some(dst_clock),
        });
        hs.step(&src, client).await?;
        hs.configured(&src, Command::enable_ntp(id));

        let start = Command::Start(StartPayload {
            msm_id: id,
            peer_address: Some(dst_address),
            parameters: Some(m.parameters.clone()),
        });
        hs.step(&src, start).await?;
        Ok(())
    }

    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
        let id = hs.id();
        let dst = m.destination()?;
        let src = &m.source_probe;

        let mut first_error = match hs.step(dst, Command::stop(id)).await {
            Ok(_) => None,
            Err(err @ CoordError::Mismatch { .. }) => return Err(err),
            Err(err) => Some(err),
        };
        for command in [Command::stop(id), Command::enable_ntp(id)] {
            if let Err(err) = hs.step(src, command).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn finish(&self, m: &Measurement) -> Vec<(ProbeId, Command)> {
        let mut commands = Vec::with_capacity(2);
        if let Some(dst) = &m.destination_probe {
            commands.push((dst.clone(), Command::stop(m.id)));
        }
        commands.push((m.source_probe.clone(), Command::enable_ntp(m.id)));
        commands
    }
}
