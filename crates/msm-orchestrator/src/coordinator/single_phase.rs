// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-phase handshakes: one `start` to the source probe.

use async_trait::async_trait;

use super::{Handshake, HandshakeShape};
use crate::directory::AddressKind;
use crate::error::CoordError;
use crate::measurement::{Measurement, MeasurementKind};
use crate::protocol::{Command, StartPayload};

/// Round-trip latency (ping) from source to destination.
pub struct Latency;

/// Power draw sampled on the source probe alone.
pub struct Energy;

/// Background traffic between two probes.
pub struct Coexistence;

async fn start_source(hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
    let src = m.source_probe.clone();
    m.source_address = Some(hs.resolve(&src, AddressKind::Primary).await?);

    let peer_address = match &m.destination_probe {
        Some(dst) => Some(hs.resolve(dst, AddressKind::Primary).await?),
        None => None,
    };
    m.destination_address = peer_address;

    let start = Command::Start(StartPayload {
        msm_id: hs.id(),
        peer_address,
        parameters: Some(m.parameters.clone()),
    });
    hs.step(&src, start).await?;
    hs.configured(&src, Command::stop(hs.id()));
    Ok(())
}

async fn stop_source(hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
    hs.step(&m.source_probe, Command::stop(hs.id())).await?;
    Ok(())
}

#[async_trait]
impl HandshakeShape for Latency {
    fn kind(&self) -> MeasurementKind {
        MeasurementKind::Latency
    }

    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
        start_source(hs, m).await
    }

    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
        stop_source(hs, m).await
    }
}

#[async_trait]
impl HandshakeShape for Energy {
    fn kind(&self) -> MeasurementKind {
        MeasurementKind::Energy
    }

    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
        // Sensor presence diagnostic; the probe reports a missing sensor
        // through its error channel.
        hs.send(&m.source_probe, &Command::Check);
        start_source(hs, m).await
    }

    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
        stop_source(hs, m).await
    }
}

#[async_trait]
impl HandshakeShape for Coexistence {
    fn kind(&self) -> MeasurementKind {
        MeasurementKind::Coexistence
    }

    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
        start_source(hs, m).await
    }

    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
        stop_source(hs, m).await
    }
}
