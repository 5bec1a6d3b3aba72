// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement coordinators.
//!
//! Every kind is driven by the same [`Coordinator`] template; a
//! [`HandshakeShape`] supplies the kind-specific steps:
//!
//! | Shape | Kinds | Steps |
//! |-------|-------|-------|
//! | single-phase | latency, energy, coexistence | `start` to the source |
//! | two-phase | throughput | `conf` server, `conf` client, `start` |
//! | clock-synchronized | age of information, UDP latency | `disable_ntp_service` destination, `disable_ntp_service` source, `start` |
//!
//! The template owns the lifecycle around the shape: it assigns the id,
//! compensates configured probes when a step fails, records the measurement
//! once every step succeeded, ingests results and marks the measurement
//! completed or failed.

mod clock_sync;
mod handshake;
mod single_phase;
mod throughput;

pub use clock_sync::ClockSync;
pub use handshake::{Handshake, MISMATCH_MARKER};
pub use single_phase::{Coexistence, Energy, Latency};
pub use throughput::Throughput;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::correlation::CorrelationRegistry;
use crate::directory::ProbeDirectory;
use crate::error::CoordError;
use crate::measurement::{
    Measurement, MeasurementId, MeasurementKind, MeasurementRequest, MeasurementState, ProbeId,
};
use crate::protocol::{AckType, Command, ErrorReport, ResultMessage, StatusReply};
use crate::report::MeasurementResult;
use crate::router::{
    CommandRouter, Coordinates, ErrorHandler, MeasurementHandler, ResultHandler, RouterError,
    StatusHandler,
};
use crate::store::MeasurementStore;
use crate::transport::ProbeTransport;

/// Collaborators shared by every coordinator.
pub struct Context {
    pub transport: Arc<dyn ProbeTransport>,
    pub directory: Arc<ProbeDirectory>,
    pub store: Arc<dyn MeasurementStore>,
    /// Fixed bound on every correlated wait.
    pub timeout: Duration,
}

/// Kind-specific part of a coordinator.
#[async_trait]
pub trait HandshakeShape: Send + Sync + 'static {
    fn kind(&self) -> MeasurementKind;

    /// Drive the probes until the measurement runs. Must call
    /// [`Handshake::configured`] after each step that leaves a probe
    /// configured, and fill in the resolved addresses.
    async fn configure(&self, hs: &mut Handshake<'_>, m: &mut Measurement) -> Result<(), CoordError>;

    /// Reverse handshake of a running measurement.
    async fn teardown(&self, hs: &Handshake<'_>, m: &Measurement) -> Result<(), CoordError>;

    /// Commands owed once the measurement ended on its own (final result
    /// or runtime failure). Sent without waiting for replies.
    fn finish(&self, _m: &Measurement) -> Vec<(ProbeId, Command)> {
        Vec::new()
    }
}

/// Coordinator for one measurement kind.
pub struct Coordinator<S> {
    shape: S,
    ctx: Arc<Context>,
    waiters: CorrelationRegistry<MeasurementId, StatusReply>,
    /// Queued and started measurements owned by this coordinator.
    active: DashMap<MeasurementId, Measurement>,
    /// Results that arrived while their measurement was still queued.
    early: DashMap<MeasurementId, Vec<(ProbeId, ResultMessage)>>,
}

pub type ThroughputCoordinator = Coordinator<Throughput>;
pub type LatencyCoordinator = Coordinator<Latency>;
pub type EnergyCoordinator = Coordinator<Energy>;
pub type CoexistenceCoordinator = Coordinator<Coexistence>;
/// Drives age-of-information and UDP-latency measurements.
pub type ClockSyncCoordinator = Coordinator<ClockSync>;

impl<S: HandshakeShape> Coordinator<S> {
    pub fn new(shape: S, ctx: Arc<Context>) -> Self {
        Self {
            shape,
            ctx,
            waiters: CorrelationRegistry::new(),
            active: DashMap::new(),
            early: DashMap::new(),
        }
    }

    pub fn is_active(&self, id: &MeasurementId) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of steps currently waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.waiters.pending()
    }

    fn handshake(&self, id: MeasurementId) -> Handshake<'_> {
        Handshake::new(&self.ctx, &self.waiters, self.shape.kind(), id)
    }

    fn finish(&self, m: &Measurement) {
        for (probe, command) in self.shape.finish(m) {
            handshake::send(&self.ctx, self.shape.kind(), &probe, &command);
        }
    }

    fn complete(&self, id: MeasurementId) {
        match self.ctx.store.mark_completed(&id) {
            Ok(true) => tracing::info!("[{}] completed", id),
            Ok(false) => tracing::debug!("[{}] final result for a measurement not running", id),
            Err(e) => tracing::warn!("[{}] could not mark completed: {}", id, e),
        }
        if let Some((_, m)) = self.active.remove(&id) {
            self.finish(&m);
        }
    }

    /// Store a result and complete the measurement on the terminal one.
    fn ingest(&self, id: MeasurementId, probe: &ProbeId, result: ResultMessage) -> bool {
        let terminal = !self.shape.kind().is_repeated() || result.last;

        let record = MeasurementResult::new(id, probe.clone(), result.data);
        if let Err(e) = self.ctx.store.insert_result(&record) {
            tracing::warn!("[{}] result from {} dropped: {}", id, probe, e);
            return false;
        }
        tracing::info!(
            "[{}] result {} from {}{}",
            id,
            record.id,
            probe,
            if terminal { " (final)" } else { "" }
        );

        if terminal {
            self.complete(id);
        }
        true
    }

    /// Forget a measurement whose handshake or recording failed.
    fn abandon(&self, id: MeasurementId) {
        self.active.remove(&id);
        if let Some((_, held)) = self.early.remove(&id) {
            tracing::debug!("[{}] discarding {} early result(s)", id, held.len());
        }
    }

    /// Runtime failure of a started measurement.
    fn fail_running(&self, id: MeasurementId, probe: &ProbeId, reason: &str) -> bool {
        let Some((_, m)) = self
            .active
            .remove_if(&id, |_, m| m.state == MeasurementState::Started)
        else {
            tracing::debug!("[{}] failure report from {} for no running measurement", id, probe);
            return false;
        };
        tracing::warn!("[{}] failed on {}: {}", id, probe, reason);
        match self.ctx.store.mark_failed(&id) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("[{}] already terminal", id),
            Err(e) => tracing::warn!("[{}] could not mark failed: {}", id, e),
        }
        self.finish(&m);
        true
    }
}

#[async_trait]
impl<S: HandshakeShape> MeasurementHandler for Coordinator<S> {
    async fn prepare(&self, request: MeasurementRequest) -> Result<Measurement, CoordError> {
        let kind = self.shape.kind();
        if request.kind() != kind {
            return Err(CoordError::InvalidRequest(format!(
                "{} coordinator cannot prepare a {} measurement",
                kind,
                request.kind()
            )));
        }
        request.validate()?;

        let mut measurement = Measurement::queued(request);
        let id = measurement.id;
        tracing::info!(
            "[{}] preparing {} measurement {} -> {}",
            id,
            kind,
            measurement.source_probe,
            measurement
                .destination_probe
                .as_ref()
                .map_or("-", ProbeId::as_str)
        );
        self.active.insert(id, measurement.clone());

        let mut hs = self.handshake(id);
        if let Err(err) = self.shape.configure(&mut hs, &mut measurement).await {
            hs.compensate();
            self.abandon(id);
            tracing::warn!("[{}] handshake failed: {}", id, err);
            return Err(err);
        }

        measurement.transition(MeasurementState::Started);
        if let Err(e) = self.ctx.store.insert(&measurement) {
            self.abandon(id);
            tracing::error!("[{}] handshake succeeded but recording failed: {}", id, e);
            return Err(CoordError::Persistence {
                id,
                reason: e.to_string(),
            });
        }

        // Results stop being held once the tracked copy is started.
        if let Some(mut tracked) = self.active.get_mut(&id) {
            *tracked = measurement.clone();
        }
        tracing::info!("[{}] started", id);

        let held = self.early.remove(&id).map(|(_, held)| held).unwrap_or_default();
        for (probe, result) in held {
            self.ingest(id, &probe, result);
        }
        Ok(measurement)
    }

    async fn stop(&self, measurement: Measurement) -> Result<String, CoordError> {
        let id = measurement.id;
        if !self.active.contains_key(&id) {
            tracing::debug!("[{}] stopping a measurement started by an earlier run", id);
        }

        tracing::info!("[{}] stopping", id);
        let outcome = self.shape.teardown(&self.handshake(id), &measurement).await;
        self.active.remove(&id);

        // A stopped measurement ends as failed, cleanly stopped or not.
        match self.ctx.store.mark_failed(&id) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("[{}] already terminal when stopped", id),
            Err(e) => tracing::warn!("[{}] could not mark failed: {}", id, e),
        }

        match outcome {
            Ok(()) => Ok(format!("measurement {} stopped", id)),
            Err(err) => {
                tracing::warn!("[{}] unclean stop: {}", id, err);
                Err(err)
            }
        }
    }
}

impl<S: HandshakeShape> StatusHandler for Coordinator<S> {
    fn on_status(&self, probe: &ProbeId, ack: AckType, reply: StatusReply) -> bool {
        let Some(id) = reply.msm_id else {
            tracing::debug!("Status from {} without msm_id: {:?}", probe, reply);
            return false;
        };
        match ack {
            AckType::Ack => self.waiters.fulfill(&id, Ok(reply)),
            AckType::Nack => {
                let reason = reply.reason.clone();
                let is_start = reply.command.as_deref() == Some("start");
                if self.waiters.fulfill_reason(&id, reason.as_deref(), reply) {
                    return true;
                }
                // No step is waiting: the probe gave up on a running measurement.
                is_start && self.fail_running(id, probe, reason.as_deref().unwrap_or("NACK"))
            }
            AckType::Other(kind) => {
                tracing::debug!("[{}] ignoring status '{}' from {}", id, kind, probe);
                false
            }
        }
    }
}

impl<S: HandshakeShape> ResultHandler for Coordinator<S> {
    fn on_result(&self, probe: &ProbeId, result: ResultMessage) -> bool {
        let Some(id) = result.msm_id else {
            tracing::warn!("Result from {} without msm_id dropped", probe);
            return false;
        };
        if let Some(tracked) = self.active.get(&id) {
            if tracked.state == MeasurementState::Queued {
                tracing::debug!("[{}] holding result from {} until recorded", id, probe);
                self.early.entry(id).or_default().push((probe.clone(), result));
                return true;
            }
        }
        self.ingest(id, probe, result)
    }
}

impl<S: HandshakeShape> ErrorHandler for Coordinator<S> {
    fn on_error(&self, probe: &ProbeId, report: ErrorReport) -> bool {
        let Some(id) = report.msm_id else {
            tracing::warn!("Probe {} reported: {}", probe, report.reason);
            return false;
        };
        if self.waiters.is_pending(&id) {
            return self.waiters.fulfill(&id, Err(report.reason));
        }
        self.fail_running(id, probe, &report.reason)
    }
}

impl<S: HandshakeShape> Coordinates for Coordinator<S> {
    fn kind(&self) -> MeasurementKind {
        self.shape.kind()
    }
}

/// Register one coordinator per kind.
pub fn register_all(router: &mut CommandRouter, ctx: &Arc<Context>) -> Result<(), RouterError> {
    router.register(Arc::new(ThroughputCoordinator::new(Throughput, Arc::clone(ctx))))?;
    router.register(Arc::new(LatencyCoordinator::new(Latency, Arc::clone(ctx))))?;
    router.register(Arc::new(EnergyCoordinator::new(Energy, Arc::clone(ctx))))?;
    router.register(Arc::new(ClockSyncCoordinator::new(
        ClockSync::age_of_information(),
        Arc::clone(ctx),
    )))?;
    router.register(Arc::new(ClockSyncCoordinator::new(
        ClockSync::udp_latency(),
        Arc::clone(ctx),
    )))?;
    router.register(Arc::new(CoexistenceCoordinator::new(Coexistence, Arc::clone(ctx))))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::{MockTransport, Published};

    pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) struct Harness {
        pub ctx: Arc<Context>,
        pub mock: Arc<MockTransport>,
        pub store: Arc<MemoryStore>,
    }

    /// Context with probes P1 (10.0.0.11) and P2 (10.0.0.12) already known.
    pub(crate) fn harness() -> Harness {
        let mock = Arc::new(MockTransport::new());
        let transport = Arc::clone(&mock) as Arc<dyn ProbeTransport>;
        let directory = Arc::new(ProbeDirectory::new(Arc::clone(&transport), "10.0.0.1", TIMEOUT));
        for (probe, last) in [("P1", 11), ("P2", 12)] {
            directory.insert(
                ProbeId::new(probe),
                format!("10.0.0.{}", last).parse().unwrap(),
                format!("10.0.1.{}", last).parse().unwrap(),
            );
        }
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(Context {
            transport,
            directory,
            store: Arc::clone(&store) as Arc<dyn MeasurementStore>,
            timeout: TIMEOUT,
        });
        Harness { ctx, mock, store }
    }

    /// Reply to a published command.
    pub(crate) fn reply(published: &Published, reason: Option<&str>) -> StatusReply {
        let command = published.command().unwrap();
        StatusReply {
            msm_id: command.msm_id(),
            command: Some(command.name().to_string()),
            reason: reason.map(str::to_string),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::measurement::MeasurementParams;
    use crate::report::{LatencyReport, ResultData};
    use crate::store::MemoryStore;

    fn latency_request() -> MeasurementRequest {
        MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Latency))
            .destination("P2")
    }

    async fn started_latency(h: &Harness) -> (Arc<LatencyCoordinator>, Measurement) {
        let coord = Arc::new(LatencyCoordinator::new(Latency, Arc::clone(&h.ctx)));
        let task = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.prepare(latency_request()).await })
        };
        let start = h.mock.next().await.unwrap();
        assert!(coord.on_status(&start.probe, AckType::Ack, reply(&start, None)));
        let m = task.await.unwrap().unwrap();
        (coord, m)
    }

    #[tokio::test]
    async fn test_prepare_rejects_other_kind() {
        let h = harness();
        let coord = LatencyCoordinator::new(Latency, Arc::clone(&h.ctx));
        let request = MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Energy));
        assert!(matches!(
            coord.prepare(request).await,
            Err(CoordError::InvalidRequest(_))
        ));
        assert!(h.mock.published().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_start_nack_fails_measurement() {
        let h = harness();
        let (coord, m) = started_latency(&h).await;

        let late = StatusReply {
            msm_id: Some(m.id),
            command: Some("start".into()),
            reason: Some("ping: unknown host".into()),
            ..Default::default()
        };
        assert!(coord.on_status(&ProbeId::new("P1"), AckType::Nack, late));
        assert_eq!(
            h.store.find_by_id(&m.id).unwrap().unwrap().state,
            MeasurementState::Failed
        );
        assert!(!coord.is_active(&m.id));
    }

    #[tokio::test]
    async fn test_error_report_fails_running_measurement() {
        let h = harness();
        let (coord, m) = started_latency(&h).await;

        let report = ErrorReport {
            msm_id: Some(m.id),
            reason: "tool crashed".into(),
        };
        assert!(coord.on_error(&ProbeId::new("P1"), report.clone()));
        assert!(!coord.on_error(&ProbeId::new("P1"), report));
        assert_eq!(
            h.store.find_by_id(&m.id).unwrap().unwrap().state,
            MeasurementState::Failed
        );
    }

    #[tokio::test]
    async fn test_result_completes_and_is_linked() {
        let h = harness();
        let (coord, m) = started_latency(&h).await;

        let result = ResultMessage {
            kind: MeasurementKind::Latency,
            msm_id: Some(m.id),
            last: false,
            data: ResultData::Latency(LatencyReport::default()),
        };
        assert!(coord.on_result(&ProbeId::new("P1"), result.clone()));

        let stored = h.store.find_by_id(&m.id).unwrap().unwrap();
        assert_eq!(stored.state, MeasurementState::Completed);
        assert_eq!(stored.results.len(), 1);
        assert_eq!(coord.active_count(), 0);

        // Results without an id are dropped.
        let orphan = ResultMessage {
            msm_id: None,
            ..result
        };
        assert!(!coord.on_result(&ProbeId::new("P1"), orphan));
    }

    fn latency_result(id: MeasurementId) -> ResultMessage {
        ResultMessage {
            kind: MeasurementKind::Latency,
            msm_id: Some(id),
            last: false,
            data: ResultData::Latency(LatencyReport::default()),
        }
    }

    #[tokio::test]
    async fn test_result_before_start_ack_is_kept() {
        let h = harness();
        let coord = Arc::new(LatencyCoordinator::new(Latency, Arc::clone(&h.ctx)));
        let task = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.prepare(latency_request()).await })
        };
        let start = h.mock.next().await.unwrap();
        let id = start.command().unwrap().msm_id().unwrap();

        // The result topic overtook the status topic.
        assert!(coord.on_result(&ProbeId::new("P1"), latency_result(id)));
        assert!(coord.on_status(&start.probe, AckType::Ack, reply(&start, None)));
        task.await.unwrap().unwrap();

        let stored = h.store.find_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.state, MeasurementState::Completed);
        assert_eq!(stored.results.len(), 1);
        assert_eq!(coord.active_count(), 0);
    }

    #[tokio::test]
    async fn test_result_right_after_start_ack_is_kept() {
        let h = harness();
        let coord = Arc::new(LatencyCoordinator::new(Latency, Arc::clone(&h.ctx)));
        let task = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.prepare(latency_request()).await })
        };
        let start = h.mock.next().await.unwrap();
        let id = start.command().unwrap().msm_id().unwrap();

        // Both arrive before the preparing task runs again.
        assert!(coord.on_status(&start.probe, AckType::Ack, reply(&start, None)));
        assert!(coord.on_result(&ProbeId::new("P1"), latency_result(id)));
        task.await.unwrap().unwrap();

        let stored = h.store.find_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.state, MeasurementState::Completed);
        assert_eq!(h.store.results_for(&id).unwrap().len(), 1);
        assert_eq!(coord.active_count(), 0);
    }

    #[tokio::test]
    async fn test_status_without_id_is_ignored() {
        let h = harness();
        let coord = LatencyCoordinator::new(Latency, Arc::clone(&h.ctx));
        assert!(!coord.on_status(&ProbeId::new("P1"), AckType::Ack, StatusReply::default()));
    }

    struct FailingStore(MemoryStore);

    impl MeasurementStore for FailingStore {
        fn insert(&self, _: &Measurement) -> anyhow::Result<MeasurementId> {
            anyhow::bail!("disk full")
        }
        fn insert_result(&self, r: &MeasurementResult) -> anyhow::Result<crate::report::ResultId> {
            self.0.insert_result(r)
        }
        fn mark_completed(&self, id: &MeasurementId) -> anyhow::Result<bool> {
            self.0.mark_completed(id)
        }
        fn mark_failed(&self, id: &MeasurementId) -> anyhow::Result<bool> {
            self.0.mark_failed(id)
        }
        fn find_by_id(&self, id: &MeasurementId) -> anyhow::Result<Option<Measurement>> {
            self.0.find_by_id(id)
        }
        fn results_for(&self, id: &MeasurementId) -> anyhow::Result<Vec<MeasurementResult>> {
            self.0.results_for(id)
        }
        fn list(&self) -> anyhow::Result<Vec<Measurement>> {
            self.0.list()
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_distinct() {
        let h = harness();
        let ctx = Arc::new(Context {
            transport: Arc::clone(&h.ctx.transport),
            directory: Arc::clone(&h.ctx.directory),
            store: Arc::new(FailingStore(MemoryStore::new())),
            timeout: TIMEOUT,
        });
        let coord = Arc::new(LatencyCoordinator::new(Latency, ctx));
        let task = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.prepare(latency_request()).await })
        };
        let start = h.mock.next().await.unwrap();
        coord.on_status(&start.probe, AckType::Ack, reply(&start, None));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordError::Persistence { .. }));
        assert!(err.to_string().contains("handshake succeeded"));
        assert_eq!(err.cause(), "PersistenceFailure");
    }

    #[tokio::test]
    async fn test_register_all_covers_every_kind() {
        let h = harness();
        let mut router = CommandRouter::new(
            Arc::clone(&h.ctx.directory),
            Arc::clone(&h.ctx.store),
        );
        register_all(&mut router, &h.ctx).unwrap();
        assert_eq!(router.registered_kinds(), MeasurementKind::ALL.to_vec());
        assert!(register_all(&mut router, &h.ctx).is_err());
    }
}
