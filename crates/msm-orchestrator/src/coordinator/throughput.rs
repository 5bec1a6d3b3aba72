// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-phase throughput handshake.
//!
//! The destination is configured as server first; its ACK carries the port
//! it bound. The source is then configured as client against that address
//! and port, and started. Each repetition reports its own result; the one
//! flagged `last` completes the measurement and stops the server.

use async_trait::async_trait;

use super::{Handshake, HandshakeShape};
use crate::directory::AddressKind;
use crate::error::CoordError;
use crate::measurement::{Measurement, MeasurementKind, MeasurementParams, ProbeId, ThroughputParams};
use crate::protocol::{Command, ConfPayload, Role, StartPayload};

pub struct Throughput;

fn params(m: &Measurement) -> Result<ThroughputParams, CoordError> {
    match &m.parameters {
        MeasurementParams::Throughput(p) => Ok(p.clone()),
        other => Err(CoordError::InvalidRequest(format!(
            "expected throughput parameters, got {}",
            other.kind()
        ))),
    }
}

#[async_trait]
impl HandshakeShape for Throughput {
    fn kind(&self) -> MeasurementKind {
        MeasurementKind::Throughput
    }

    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError> {
        let params = params(m)?;
        let id = hs.id();
        let src = m.source_probe.clone();
        let dst = m.destination()?.clone();

        let server_address = hs.resolve(&dst, AddressKind::Primary).await?;
        m.source_address = Some(hs.resolve(&src, AddressKind::Primary).await?);
        m.destination_address = Some(server_address);

        let server = Command::Conf(ConfPayload {
            msm_id: id,
            role: Role::Server,
            server_address: None,
            port: None,
            parameters: Some(params.clone()),
        });
        let ack = hs.step(&dst, server).await?;
        hs.configured(&dst, Command::stop(id));

        let port = ack.port.ok_or_else(|| CoordError::Rejected {
            probe: dst.clone(),
            command: "conf".into(),
            reason: "server acknowledged without a port".into(),
        })?;
        tracing::debug!("[{}] server {} listening on {}:{}", id, dst, server_address, port);

        let client = Command::Conf(ConfPayload {
            msm_id: id,
            role: Role::Client,
            server_address: Some(server_address),
            port: Some(port),
            parameters: Some(params),
        });
        hs.step(&src, client).await?;
        hs.configured(&src, Command::stop(id));

        let start = Command::Start(StartPayload {
            msm_id: id,
            peer_address: Some(server_address),
            parameters: None,
        });
        hs.step(&src, start).await?;
        Ok(())
    }

    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError> {
        let client = hs.step(&m.source_probe, Command::stop(hs.id())).await;
        let server = hs.step(m.destination()?, Command::stop(hs.id())).await;
        client.and(server).map(|_| ())
    }

    fn finish(&self, m: &Measurement) -> Vec<(ProbeId, Command)> {
        m.destination_probe
            .iter()
            .map(|dst| (dst.clone(), Command::stop(m.id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::ThroughputCoordinator;
    use super::*;
    use crate::measurement::MeasurementRequest;
    use crate::protocol::{AckType, StatusReply};
    use crate::router::{MeasurementHandler, StatusHandler};

    fn request() -> MeasurementRequest {
        MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Throughput))
            .destination("P2")
    }

    fn with_port(mut reply: StatusReply, port: u16) -> StatusReply {
        reply.port = Some(port);
        reply
    }

    #[tokio::test]
    async fn test_client_conf_carries_server_port() {
        let h = harness();
        let coord = std::sync::Arc::new(ThroughputCoordinator::new(Throughput, h.ctx.clone()));
        let task = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.prepare(request()).await })
        };

        let server = h.mock.next().await.unwrap();
        assert_eq!(server.probe, ProbeId::new("P2"));
        coord.on_status(&server.probe, AckType::Ack, with_port(reply(&server, None), 5201));

        let client = h.mock.next().await.unwrap();
        match client.command() {
            Some(Command::Conf(p)) => {
                assert_eq!(p.role, Role::Client);
                assert_eq!(p.port, Some(5201));
                assert_eq!(p.server_address.unwrap().to_string(), "10.0.0.12");
            }
            other => panic!("unexpected {:?}", other),
        }
        coord.on_status(&client.probe, AckType::Ack, reply(&client, None));

        let start = h.mock.next().await.unwrap();
        assert_eq!(start.command_name(), Some("start"));
        assert_eq!(start.probe, ProbeId::new("P1"));
        coord.on_status(&start.probe, AckType::Ack, reply(&start, None));

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_server_ack_without_port_aborts_and_compensates() {
        let h = harness();
        let coord = std::sync::Arc::new(ThroughputCoordinator::new(Throughput, h.ctx.clone()));
        let task = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.prepare(request()).await })
        };

        let server = h.mock.next().await.unwrap();
        coord.on_status(&server.probe, AckType::Ack, reply(&server, None));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordError::Rejected { .. }));

        let undo = h.mock.next().await.unwrap();
        assert_eq!(undo.probe, ProbeId::new("P2"));
        assert_eq!(undo.command_name(), Some("stop"));
        assert_eq!(h.mock.count("conf"), 1);
    }
}
