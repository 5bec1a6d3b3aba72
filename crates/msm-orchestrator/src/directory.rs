// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Probe directory.
//!
//! Caches `probe id -> (address, clock-sync address)`. Entries are created or
//! refreshed whenever a probe announces `ONLINE`/`UPDATE` and evicted on
//! `OFFLINE`. A cache miss publishes an address request to the probe and
//! waits for its next announcement; concurrent misses for the same probe
//! share one outstanding request.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::CoordError;
use crate::measurement::ProbeId;
use crate::protocol::{encode_command, AddressPayload, Command, HandlerTag, ProbeAnnouncement, ProbeStatus};
use crate::transport::ProbeTransport;

/// Which of a probe's two addresses is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Primary,
    ClockSync,
}

/// Cached addresses of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEntry {
    pub address: IpAddr,
    pub clock_sync_address: IpAddr,
    pub online: bool,
    pub last_seen: Instant,
}

impl ProbeEntry {
    fn from_announcement(a: &ProbeAnnouncement) -> Self {
        Self {
            address: a.address,
            clock_sync_address: a.clock_sync_address,
            online: true,
            last_seen: Instant::now(),
        }
    }

    pub fn get(&self, kind: AddressKind) -> IpAddr {
        match kind {
            AddressKind::Primary => self.address,
            AddressKind::ClockSync => self.clock_sync_address,
        }
    }
}

/// Outstanding address request for one probe.
struct InFlight {
    /// Every resolver sharing this request gives up at the same instant.
    deadline: tokio::time::Instant,
    waiters: Vec<oneshot::Sender<ProbeEntry>>,
}

/// Shared probe address cache.
pub struct ProbeDirectory {
    entries: RwLock<HashMap<ProbeId, ProbeEntry>>,
    inflight: Mutex<HashMap<ProbeId, InFlight>>,
    transport: Arc<dyn ProbeTransport>,
    coordinator_address: String,
    timeout: Duration,
}

impl ProbeDirectory {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        coordinator_address: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            transport,
            coordinator_address: coordinator_address.into(),
            timeout,
        }
    }

    /// Resolve one of a probe's addresses, asking the probe on a cache miss.
    pub async fn resolve(&self, probe: &ProbeId, kind: AddressKind) -> Result<IpAddr, CoordError> {
        if let Some(entry) = self.get(probe) {
            return Ok(entry.get(kind));
        }

        let (tx, rx) = oneshot::channel();
        let (first, deadline) = {
            let mut inflight = self.inflight.lock();
            // An announcement may have landed between the lookup and this lock.
            if let Some(entry) = self.get(probe) {
                return Ok(entry.get(kind));
            }
            let now = tokio::time::Instant::now();
            let request = inflight.entry(probe.clone()).or_insert_with(|| InFlight {
                deadline: now + self.timeout,
                waiters: Vec::new(),
            });
            // An expired request is replaced by a fresh one.
            let expired = request.deadline <= now;
            if expired {
                request.deadline = now + self.timeout;
            }
            request.waiters.push(tx);
            (expired || request.waiters.len() == 1, request.deadline)
        };

        if first {
            tracing::debug!("Requesting address of probe {}", probe);
            let sent = encode_command(HandlerTag::Probe, &Command::GetAddress)
                .map_err(|e| CoordError::Transport(e.to_string()))
                .and_then(|raw| self.transport.publish(probe, &raw).map_err(CoordError::from));
            if let Err(err) = sent {
                self.inflight.lock().remove(probe);
                return Err(err);
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(entry)) => Ok(entry.get(kind)),
            _ => {
                self.prune_inflight(probe);
                tracing::warn!("Probe {} did not announce its address", probe);
                Err(CoordError::ProbeNotFound(probe.clone()))
            }
        }
    }

    /// Drop waiters that gave up so the next miss issues a fresh request.
    fn prune_inflight(&self, probe: &ProbeId) {
        let mut inflight = self.inflight.lock();
        if let Some(request) = inflight.get_mut(probe) {
            request.waiters.retain(|w| !w.is_closed());
            if request.waiters.is_empty() {
                inflight.remove(probe);
            }
        }
    }

    /// Apply a probe status announcement.
    pub fn handle_status(&self, probe: &ProbeId, status: ProbeStatus) {
        match status {
            ProbeStatus::Online(a) => {
                tracing::info!(
                    "Probe {} online at {} (clock sync {})",
                    probe,
                    a.address,
                    a.clock_sync_address
                );
                self.store(probe, &a);
                self.send_coordinator_address(probe);
            }
            ProbeStatus::Update(a) => {
                tracing::debug!("Probe {} updated address to {}", probe, a.address);
                self.store(probe, &a);
            }
            ProbeStatus::Offline => {
                tracing::info!("Probe {} offline", probe);
                self.entries.write().remove(probe);
            }
            ProbeStatus::Other(kind) => {
                tracing::debug!("Ignoring probe {} status '{}'", probe, kind);
            }
        }
    }

    fn store(&self, probe: &ProbeId, announcement: &ProbeAnnouncement) {
        let entry = ProbeEntry::from_announcement(announcement);
        self.entries.write().insert(probe.clone(), entry);

        let waiters = self
            .inflight
            .lock()
            .remove(probe)
            .map(|request| request.waiters)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(entry);
        }
    }

    /// One-way courtesy message; no reply is expected.
    fn send_coordinator_address(&self, probe: &ProbeId) {
        let cmd = Command::CoordinatorAddress(AddressPayload {
            address: self.coordinator_address.clone(),
        });
        let sent = encode_command(HandlerTag::Probe, &cmd)
            .map_err(|e| e.to_string())
            .and_then(|raw| self.transport.publish(probe, &raw).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            tracing::warn!("Could not send coordinator address to {}: {}", probe, e);
        }
    }

    /// Seed an entry without waiting for an announcement.
    pub fn insert(&self, probe: ProbeId, address: IpAddr, clock_sync_address: IpAddr) {
        self.store(
            &probe,
            &ProbeAnnouncement {
                address,
                clock_sync_address,
            },
        );
    }

    pub fn get(&self, probe: &ProbeId) -> Option<ProbeEntry> {
        self.entries.read().get(probe).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all known probes.
    pub fn probes(&self) -> Vec<(ProbeId, ProbeEntry)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn announcement(last: u8) -> ProbeAnnouncement {
        ProbeAnnouncement {
            address: format!("10.0.0.{}", last).parse().unwrap(),
            clock_sync_address: format!("10.0.1.{}", last).parse().unwrap(),
        }
    }

    fn directory(mock: &Arc<MockTransport>) -> Arc<ProbeDirectory> {
        Arc::new(ProbeDirectory::new(
            Arc::clone(mock) as Arc<dyn ProbeTransport>,
            "10.0.0.1",
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_online_stores_both_addresses_and_greets() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p1 = ProbeId::new("P1");

        dir.handle_status(&p1, ProbeStatus::Online(announcement(11)));

        assert_eq!(
            dir.resolve(&p1, AddressKind::Primary).await.unwrap().to_string(),
            "10.0.0.11"
        );
        assert_eq!(
            dir.resolve(&p1, AddressKind::ClockSync).await.unwrap().to_string(),
            "10.0.1.11"
        );
        assert_eq!(mock.count("coordinator_address"), 1);
        assert_eq!(mock.count("get_address"), 0);
    }

    #[tokio::test]
    async fn test_offline_evicts() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p1 = ProbeId::new("P1");

        dir.handle_status(&p1, ProbeStatus::Online(announcement(11)));
        dir.handle_status(&p1, ProbeStatus::Offline);
        assert!(dir.get(&p1).is_none());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_miss_requests_and_waits_for_update() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p2 = ProbeId::new("P2");

        let resolver = {
            let dir = Arc::clone(&dir);
            let p2 = p2.clone();
            tokio::spawn(async move { dir.resolve(&p2, AddressKind::ClockSync).await })
        };

        let request = mock.next().await.unwrap();
        assert_eq!(request.probe, p2);
        assert_eq!(request.command_name(), Some("get_address"));

        dir.handle_status(&p2, ProbeStatus::Update(announcement(12)));
        let addr = resolver.await.unwrap().unwrap();
        assert_eq!(addr.to_string(), "10.0.1.12");
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_request() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p2 = ProbeId::new("P2");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let dir = Arc::clone(&dir);
            let p2 = p2.clone();
            tasks.push(tokio::spawn(async move {
                dir.resolve(&p2, AddressKind::Primary).await
            }));
        }

        // Wait for the single request, then let the other resolvers queue up.
        mock.next().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        dir.handle_status(&p2, ProbeStatus::Update(announcement(12)));

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().to_string(), "10.0.0.12");
        }
        assert_eq!(mock.count("get_address"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_probe_is_not_found() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p3 = ProbeId::new("P3");

        let err = dir.resolve(&p3, AddressKind::Primary).await.unwrap_err();
        assert_eq!(err, CoordError::ProbeNotFound(p3.clone()));

        // The timed-out request is forgotten, so the next miss asks again.
        let _ = dir.resolve(&p3, AddressKind::Primary).await;
        assert_eq!(mock.count("get_address"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_shares_the_request_deadline() {
        let mock = Arc::new(MockTransport::new());
        let dir = directory(&mock);
        let p3 = ProbeId::new("P3");
        let begin = tokio::time::Instant::now();

        let first = {
            let dir = Arc::clone(&dir);
            let p3 = p3.clone();
            tokio::spawn(async move { dir.resolve(&p3, AddressKind::Primary).await })
        };
        mock.next().await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        let late = {
            let dir = Arc::clone(&dir);
            let p3 = p3.clone();
            tokio::spawn(async move {
                let result = dir.resolve(&p3, AddressKind::Primary).await;
                (result, tokio::time::Instant::now())
            })
        };

        assert!(first.await.unwrap().is_err());
        let (result, ended) = late.await.unwrap();
        assert_eq!(result.unwrap_err(), CoordError::ProbeNotFound(p3));
        let waited = ended - begin;
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(mock.count("get_address"), 1);
    }
}
