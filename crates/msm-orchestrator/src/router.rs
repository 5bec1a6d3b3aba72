// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command router.
//!
//! Demultiplexes inbound status/result/error messages to the handler
//! registered for their `handler` tag, and multiplexes `prepare`/`stop`
//! calls from the ingress boundary to the coordinator of the declared kind.
//!
//! Handler tables are fixed-size arrays indexed by [`MeasurementKind`], so a
//! kind without a coordinator is an empty slot, never a string lookup miss.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::directory::ProbeDirectory;
use crate::error::CoordError;
use crate::measurement::{Measurement, MeasurementId, MeasurementKind, MeasurementRequest, MeasurementState, ProbeId};
use crate::protocol::{
    decode_error, decode_result, decode_status, AckType, ErrorReport, InboundStatus, ProtocolError,
    ResultMessage, StatusReply,
};
use crate::store::MeasurementStore;
use crate::transport::InboundMessage;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{table} handler for '{kind}' is already registered")]
    AlreadyRegistered {
        table: &'static str,
        kind: MeasurementKind,
    },

    #[error("undecodable {class} message from {probe}: {source}")]
    Decode {
        class: &'static str,
        probe: ProbeId,
        #[source]
        source: ProtocolError,
    },
}

/// Lifecycle entry points of a coordinator.
#[async_trait]
pub trait MeasurementHandler: Send + Sync {
    /// Run the configuration handshake. On success the measurement is
    /// `started` and recorded in the store.
    async fn prepare(&self, request: MeasurementRequest) -> Result<Measurement, CoordError>;

    /// Run the reverse handshake of a started measurement, as loaded from
    /// the store.
    async fn stop(&self, measurement: Measurement) -> Result<String, CoordError>;
}

/// Receives ACK/NACK messages. Returns false if the message matched nothing.
pub trait StatusHandler: Send + Sync {
    fn on_status(&self, probe: &ProbeId, ack: AckType, reply: StatusReply) -> bool;
}

/// Receives result messages. Returns false if the result was dropped.
pub trait ResultHandler: Send + Sync {
    fn on_result(&self, probe: &ProbeId, result: ResultMessage) -> bool;
}

/// Receives out-of-band error reports.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, probe: &ProbeId, report: ErrorReport) -> bool;
}

/// A coordinator implementing all four roles for one kind.
pub trait Coordinates: MeasurementHandler + StatusHandler + ResultHandler + ErrorHandler {
    fn kind(&self) -> MeasurementKind;
}

type Table<T> = [Option<Arc<T>>; MeasurementKind::ALL.len()];

/// Router statistics.
#[derive(Debug)]
pub struct RouterStats {
    pub statuses_routed: AtomicU64,
    pub results_routed: AtomicU64,
    pub errors_routed: AtomicU64,
    /// Malformed messages and messages for unregistered kinds.
    pub messages_dropped: AtomicU64,
    /// Replies that matched no waiter or measurement.
    pub unsolicited: AtomicU64,
    pub created: Instant,
}

impl RouterStats {
    pub fn new() -> Self {
        Self {
            statuses_routed: AtomicU64::new(0),
            results_routed: AtomicU64::new(0),
            errors_routed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            unsolicited: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            statuses_routed: self.statuses_routed.load(Ordering::Relaxed),
            results_routed: self.results_routed.load(Ordering::Relaxed),
            errors_routed: self.errors_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of router statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub statuses_routed: u64,
    pub results_routed: u64,
    pub errors_routed: u64,
    pub messages_dropped: u64,
    pub unsolicited: u64,
    pub uptime_secs: u64,
}

impl RouterStatsSnapshot {
    pub fn total_routed(&self) -> u64 {
        self.statuses_routed + self.results_routed + self.errors_routed
    }
}

/// Routes inbound traffic and lifecycle calls to coordinators.
pub struct CommandRouter {
    directory: Arc<ProbeDirectory>,
    store: Arc<dyn MeasurementStore>,
    lifecycle: Table<dyn MeasurementHandler>,
    status: Table<dyn StatusHandler>,
    results: Table<dyn ResultHandler>,
    errors: Table<dyn ErrorHandler>,
    stats: Arc<RouterStats>,
}

impl CommandRouter {
    pub fn new(directory: Arc<ProbeDirectory>, store: Arc<dyn MeasurementStore>) -> Self {
        Self {
            directory,
            store,
            lifecycle: Default::default(),
            status: Default::default(),
            results: Default::default(),
            errors: Default::default(),
            stats: Arc::new(RouterStats::new()),
        }
    }

    fn claim<T: ?Sized>(
        table: &mut Table<T>,
        name: &'static str,
        kind: MeasurementKind,
        handler: Arc<T>,
    ) -> Result<(), RouterError> {
        let slot = &mut table[kind.index()];
        if slot.is_some() {
            return Err(RouterError::AlreadyRegistered { table: name, kind });
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn register_lifecycle(
        &mut self,
        kind: MeasurementKind,
        handler: Arc<dyn MeasurementHandler>,
    ) -> Result<(), RouterError> {
        Self::claim(&mut self.lifecycle, "lifecycle", kind, handler)
    }

    pub fn register_status(
        &mut self,
        kind: MeasurementKind,
        handler: Arc<dyn StatusHandler>,
    ) -> Result<(), RouterError> {
        Self::claim(&mut self.status, "status", kind, handler)
    }

    pub fn register_result(
        &mut self,
        kind: MeasurementKind,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<(), RouterError> {
        Self::claim(&mut self.results, "result", kind, handler)
    }

    pub fn register_error(
        &mut self,
        kind: MeasurementKind,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<(), RouterError> {
        Self::claim(&mut self.errors, "error", kind, handler)
    }

    /// Register one coordinator in all four tables.
    pub fn register<C>(&mut self, coordinator: Arc<C>) -> Result<(), RouterError>
    where
        C: Coordinates + 'static,
    {
        let kind = coordinator.kind();
        self.register_lifecycle(kind, coordinator.clone())?;
        self.register_status(kind, coordinator.clone())?;
        self.register_result(kind, coordinator.clone())?;
        self.register_error(kind, coordinator)?;
        tracing::debug!("Registered coordinator for '{}'", kind);
        Ok(())
    }

    /// Kinds with a registered lifecycle handler.
    pub fn registered_kinds(&self) -> Vec<MeasurementKind> {
        MeasurementKind::ALL
            .into_iter()
            .filter(|k| self.lifecycle[k.index()].is_some())
            .collect()
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.stats)
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch. Never fails: problems are logged and counted.
    // ------------------------------------------------------------------------

    pub fn route(&self, message: &InboundMessage) {
        match message {
            InboundMessage::Status { probe, payload } => self.route_status(probe, payload),
            InboundMessage::Result { probe, payload } => self.route_result(probe, payload),
            InboundMessage::Error { probe, payload } => self.route_error(probe, payload),
        }
    }

    fn drop_message(&self, err: RouterError) {
        tracing::warn!("Dropping message: {}", err);
        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn unregistered(&self, class: &str, kind: MeasurementKind, probe: &ProbeId) {
        tracing::warn!("No {} handler for '{}', dropping message from {}", class, kind, probe);
        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, counter: &AtomicU64, matched: bool) {
        counter.fetch_add(1, Ordering::Relaxed);
        if !matched {
            self.stats.unsolicited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn route_status(&self, probe: &ProbeId, payload: &str) {
        let status = match decode_status(payload) {
            Ok(s) => s,
            Err(source) => {
                return self.drop_message(RouterError::Decode {
                    class: "status",
                    probe: probe.clone(),
                    source,
                })
            }
        };
        match status {
            InboundStatus::Probe(status) => {
                self.directory.handle_status(probe, status);
                self.stats.statuses_routed.fetch_add(1, Ordering::Relaxed);
            }
            InboundStatus::Measurement(msg) => match &self.status[msg.kind.index()] {
                Some(handler) => {
                    let matched = handler.on_status(probe, msg.ack, msg.reply);
                    self.record(&self.stats.statuses_routed, matched);
                }
                None => self.unregistered("status", msg.kind, probe),
            },
        }
    }

    pub fn route_result(&self, probe: &ProbeId, payload: &str) {
        let result = match decode_result(payload) {
            Ok(r) => r,
            Err(source) => {
                return self.drop_message(RouterError::Decode {
                    class: "result",
                    probe: probe.clone(),
                    source,
                })
            }
        };
        match &self.results[result.kind.index()] {
            Some(handler) => {
                let matched = handler.on_result(probe, result);
                self.record(&self.stats.results_routed, matched);
            }
            None => self.unregistered("result", result.kind, probe),
        }
    }

    pub fn route_error(&self, probe: &ProbeId, payload: &str) {
        let (kind, report) = match decode_error(payload) {
            Ok(r) => r,
            Err(source) => {
                return self.drop_message(RouterError::Decode {
                    class: "error",
                    probe: probe.clone(),
                    source,
                })
            }
        };
        match &self.errors[kind.index()] {
            Some(handler) => {
                let matched = handler.on_error(probe, report);
                self.record(&self.stats.errors_routed, matched);
            }
            None => self.unregistered("error", kind, probe),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Prepare a measurement with the coordinator of its declared kind.
    pub async fn prepare(&self, request: MeasurementRequest) -> Result<Measurement, CoordError> {
        let kind = request.kind();
        let handler = self.lifecycle[kind.index()]
            .as_ref()
            .ok_or_else(|| CoordError::UnknownKind(kind.to_string()))?;
        handler.prepare(request).await
    }

    /// Stop a started measurement.
    pub async fn stop(&self, id: MeasurementId) -> Result<String, CoordError> {
        let measurement = self
            .store
            .find_by_id(&id)
            .map_err(|e| CoordError::Store(e.to_string()))?
            .ok_or_else(|| CoordError::UnknownId(id.to_string()))?;

        match measurement.state {
            MeasurementState::Started => {}
            MeasurementState::Completed => return Err(CoordError::AlreadyCompleted(id)),
            MeasurementState::Failed => return Err(CoordError::AlreadyFailed(id)),
            MeasurementState::Queued => return Err(CoordError::NotStarted(id)),
        }

        let kind = measurement.kind();
        let handler = self.lifecycle[kind.index()]
            .as_ref()
            .ok_or_else(|| CoordError::UnknownKind(kind.to_string()))?;
        handler.stop(measurement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementParams;
    use crate::store::MemoryStore;
    use crate::transport::{MockTransport, ProbeTransport};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records every call it receives.
    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<(ProbeId, AckType, StatusReply)>>,
        results: Mutex<Vec<ResultMessage>>,
        errors: Mutex<Vec<ErrorReport>>,
        stops: Mutex<Vec<MeasurementId>>,
    }

    #[async_trait]
    impl MeasurementHandler for Recorder {
        async fn prepare(&self, request: MeasurementRequest) -> Result<Measurement, CoordError> {
            let mut m = Measurement::queued(request);
            m.transition(MeasurementState::Started);
            Ok(m)
        }

        async fn stop(&self, measurement: Measurement) -> Result<String, CoordError> {
            self.stops.lock().push(measurement.id);
            Ok("stopped".into())
        }
    }

    impl StatusHandler for Recorder {
        fn on_status(&self, probe: &ProbeId, ack: AckType, reply: StatusReply) -> bool {
            let matched = reply.msm_id.is_some();
            self.statuses.lock().push((probe.clone(), ack, reply));
            matched
        }
    }

    impl ResultHandler for Recorder {
        fn on_result(&self, _probe: &ProbeId, result: ResultMessage) -> bool {
            self.results.lock().push(result);
            true
        }
    }

    impl ErrorHandler for Recorder {
        fn on_error(&self, _probe: &ProbeId, report: ErrorReport) -> bool {
            self.errors.lock().push(report);
            true
        }
    }

    impl Coordinates for Recorder {
        fn kind(&self) -> MeasurementKind {
            MeasurementKind::Latency
        }
    }

    fn router() -> (CommandRouter, Arc<MemoryStore>, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let directory = Arc::new(ProbeDirectory::new(
            Arc::clone(&mock) as Arc<dyn ProbeTransport>,
            "10.0.0.1",
            Duration::from_secs(5),
        ));
        let store = Arc::new(MemoryStore::new());
        let router = CommandRouter::new(directory, Arc::clone(&store) as Arc<dyn MeasurementStore>);
        (router, store, mock)
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let (mut router, _, _) = router();
        let recorder = Arc::new(Recorder::default());
        router.register(Arc::clone(&recorder)).unwrap();

        let err = router
            .register_status(MeasurementKind::Latency, recorder)
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::AlreadyRegistered {
                table: "status",
                kind: MeasurementKind::Latency
            }
        ));
        assert_eq!(router.registered_kinds(), vec![MeasurementKind::Latency]);
    }

    #[test]
    fn test_routes_by_handler_tag() {
        let (mut router, _, _) = router();
        let recorder = Arc::new(Recorder::default());
        router.register(Arc::clone(&recorder)).unwrap();
        let p1 = ProbeId::new("P1");
        let id = MeasurementId::new();

        router.route_status(
            &p1,
            &format!(r#"{{"handler":"latency","type":"NACK","payload":{{"msm_id":"{}","reason":"busy"}}}}"#, id),
        );
        router.route_result(
            &p1,
            &format!(r#"{{"handler":"latency","type":"result","payload":{{"msm_id":"{}"}}}}"#, id),
        );
        router.route_error(&p1, r#"{"handler":"latency","type":"error","payload":{"reason":"boom"}}"#);

        let statuses = recorder.statuses.lock();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, AckType::Nack);
        assert_eq!(statuses[0].2.reason.as_deref(), Some("busy"));
        assert_eq!(recorder.results.lock()[0].msm_id, Some(id));
        assert_eq!(recorder.errors.lock()[0].reason, "boom");

        let stats = router.stats().snapshot();
        assert_eq!(stats.total_routed(), 3);
        assert_eq!(stats.messages_dropped, 0);
    }

    #[test]
    fn test_malformed_and_unregistered_are_dropped() {
        let (router, _, _) = router();
        let p1 = ProbeId::new("P1");

        router.route_status(&p1, "{not json");
        router.route_status(&p1, r#"{"handler":"nope","type":"ACK","payload":{}}"#);
        router.route_result(&p1, r#"{"handler":"throughput","type":"result","payload":{}}"#);
        router.route_error(&p1, r#"{"handler":"probe","type":"error","payload":{}}"#);

        let stats = router.stats().snapshot();
        assert_eq!(stats.messages_dropped, 4);
        assert_eq!(stats.total_routed(), 0);
    }

    #[test]
    fn test_unsolicited_status_is_counted() {
        let (mut router, _, _) = router();
        router.register(Arc::new(Recorder::default())).unwrap();
        router.route_status(
            &ProbeId::new("P1"),
            r#"{"handler":"latency","type":"ACK","payload":{}}"#,
        );
        assert_eq!(router.stats().snapshot().unsolicited, 1);
    }

    #[test]
    fn test_probe_announcements_reach_directory() {
        let (router, _, mock) = router();
        let p1 = ProbeId::new("P1");
        router.route_status(
            &p1,
            r#"{"handler":"probe","type":"ONLINE","payload":{"address":"10.0.0.11","clock_sync_address":"10.0.1.11"}}"#,
        );
        assert_eq!(router.directory.get(&p1).unwrap().address.to_string(), "10.0.0.11");
        assert_eq!(mock.count("coordinator_address"), 1);
    }

    #[tokio::test]
    async fn test_prepare_unknown_kind() {
        let (router, _, _) = router();
        let request = MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Energy));
        let err = router.prepare(request).await.unwrap_err();
        assert_eq!(err, CoordError::UnknownKind("energy".into()));
    }

    #[tokio::test]
    async fn test_stop_routes_by_stored_kind() {
        let (mut router, store, _) = router();
        let recorder = Arc::new(Recorder::default());
        router.register(Arc::clone(&recorder)).unwrap();

        // Started by an earlier process: never prepared through this router.
        let request = MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Latency))
            .destination("P2");
        let mut m = Measurement::queued(request);
        m.transition(MeasurementState::Started);
        store.insert(&m).unwrap();

        assert_eq!(router.stop(m.id).await.unwrap(), "stopped");
        assert_eq!(*recorder.stops.lock(), vec![m.id]);
    }

    #[tokio::test]
    async fn test_stop_rejects_terminal_states_distinctly() {
        let (mut router, store, _) = router();
        let recorder = Arc::new(Recorder::default());
        router.register(Arc::clone(&recorder)).unwrap();

        let request = MeasurementRequest::new("P1", MeasurementParams::default_for(MeasurementKind::Latency))
            .destination("P2");
        let completed = router.prepare(request.clone()).await.unwrap();
        let failed = router.prepare(request.clone()).await.unwrap();
        let running = router.prepare(request).await.unwrap();
        for m in [&completed, &failed, &running] {
            store.insert(m).unwrap();
        }
        store.mark_completed(&completed.id).unwrap();
        store.mark_failed(&failed.id).unwrap();

        let e1 = router.stop(completed.id).await.unwrap_err();
        let e2 = router.stop(failed.id).await.unwrap_err();
        assert_eq!(e1, CoordError::AlreadyCompleted(completed.id));
        assert_eq!(e2, CoordError::AlreadyFailed(failed.id));
        assert_ne!(e1.to_string(), e2.to_string());
        assert!(recorder.stops.lock().is_empty());

        let unknown = MeasurementId::new();
        assert!(matches!(router.stop(unknown).await, Err(CoordError::UnknownId(_))));

        assert_eq!(router.stop(running.id).await.unwrap(), "stopped");
        assert_eq!(*recorder.stops.lock(), vec![running.id]);
    }
}
