// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestrator facade.
//!
//! Wires the directory, the router and the six coordinators over one
//! transport and one store, and exposes the two ingress operations with
//! uniform [`Response`] replies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::{register_all, Context};
use crate::directory::ProbeDirectory;
use crate::error::{CoordError, Response};
use crate::measurement::{MeasurementId, MeasurementRequest};
use crate::router::{CommandRouter, RouterError, RouterStatsSnapshot};
use crate::store::MeasurementStore;
use crate::transport::{InboundMessage, ProbeTransport};

/// Entry point for measurement lifecycle requests and inbound probe traffic.
#[derive(Clone)]
pub struct Orchestrator {
    router: Arc<CommandRouter>,
    directory: Arc<ProbeDirectory>,
    store: Arc<dyn MeasurementStore>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        store: Arc<dyn MeasurementStore>,
        coordinator_address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RouterError> {
        let directory = Arc::new(ProbeDirectory::new(
            Arc::clone(&transport),
            coordinator_address,
            timeout,
        ));
        let ctx = Arc::new(Context {
            transport,
            directory: Arc::clone(&directory),
            store: Arc::clone(&store),
            timeout,
        });

        let mut router = CommandRouter::new(Arc::clone(&directory), Arc::clone(&store));
        register_all(&mut router, &ctx)?;

        Ok(Self {
            router: Arc::new(router),
            directory,
            store,
        })
    }

    /// Prepare and start a measurement. On success the body is the
    /// serialized measurement.
    pub async fn create_measurement(&self, request: MeasurementRequest) -> Response {
        self.router.prepare(request).await.into()
    }

    /// Same as [`create_measurement`](Self::create_measurement), from a JSON
    /// request body.
    pub async fn create_measurement_json(&self, body: &str) -> Response {
        match serde_json::from_str::<MeasurementRequest>(body) {
            Ok(request) => self.create_measurement(request).await,
            Err(e) => Response::error(&CoordError::InvalidRequest(e.to_string())),
        }
    }

    /// Stop a started measurement.
    pub async fn stop_measurement(&self, id: MeasurementId) -> Response {
        match self.router.stop(id).await {
            Ok(message) => Response::message(message),
            Err(err) => Response::error(&err),
        }
    }

    /// Stop by textual id.
    pub async fn stop_measurement_str(&self, id: &str) -> Response {
        match id.parse::<MeasurementId>() {
            Ok(id) => self.stop_measurement(id).await,
            Err(_) => Response::error(&CoordError::UnknownId(id.to_string())),
        }
    }

    /// Route one inbound message synchronously.
    pub fn route(&self, message: &InboundMessage) {
        self.router.route(message);
    }

    /// Route one inbound message on its own task.
    pub fn dispatch(&self, message: InboundMessage) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        tokio::spawn(async move { router.route(&message) })
    }

    /// Route inbound messages, in arrival order, until the channel closes.
    pub fn run(&self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                router.route(&message);
            }
            tracing::debug!("Inbound channel closed");
        })
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn directory(&self) -> &Arc<ProbeDirectory> {
        &self.directory
    }

    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.router.stats().snapshot()
    }
}
