// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement Orchestrator
//!
//! Coordinates network measurements between remote probes over a
//! publish/subscribe transport. Every measurement is set up by a short
//! handshake: the coordinator publishes a command to one probe, waits for
//! the ACK correlated by measurement id, then moves to the next step.
//!
//! # Features
//!
//! - **Six measurement kinds**: throughput, latency, energy, age of
//!   information, UDP latency, coexistence
//! - **Correlated waits**: bounded, per-measurement, safe under concurrency
//! - **Compensation**: a rejected step undoes the probes already configured
//! - **Probe directory**: address cache filled by announcements and
//!   on-demand requests
//! - **Storage**: in-memory or SQLite, with results linked to measurements
//!
//! # Quick Start
//!
//! ```bash
//! # Run a throughput measurement against simulated probes
//! msm-orchestrator simulate --config lab.toml --kind throughput --source P1 --destination P2
//!
//! # Inspect stored measurements
//! msm-orchestrator list --db lab.db
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [coordinator]
//! name = "lab"
//! address = "10.0.0.1"
//! reply_timeout_ms = 5000
//!
//! [store]
//! backend = "sqlite"
//! path = "lab.db"
//!
//! [[probes]]
//! id = "P1"
//! address = "10.0.0.11"
//! clock_sync_address = "10.0.1.11"
//! ```

pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod directory;
pub mod error;
pub mod measurement;
pub mod orchestrator;
pub mod protocol;
pub mod report;
pub mod router;
pub mod sim;
pub mod store;
pub mod transport;

pub use config::{ConfigError, OrchestratorConfig, ProbeConfig, StoreBackend};
pub use correlation::{CorrelationRegistry, Outcome};
pub use directory::{AddressKind, ProbeDirectory};
pub use error::{CoordError, Response, Status};
pub use measurement::{
    Measurement, MeasurementId, MeasurementKind, MeasurementParams, MeasurementRequest,
    MeasurementState, ProbeId,
};
pub use orchestrator::Orchestrator;
pub use report::{MeasurementResult, ResultData};
pub use router::{CommandRouter, RouterError, RouterStats, RouterStatsSnapshot};
pub use sim::{ProbeScript, SimulatedProbe};
pub use store::{MeasurementStore, MemoryStore, SqliteStore};
pub use transport::{InboundMessage, LoopbackBus, MockTransport, ProbeTransport, TransportError};
