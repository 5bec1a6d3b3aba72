// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement store abstraction
//!
//! Defines the trait for storage backends (in-memory, SQLite).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;

use crate::measurement::{Measurement, MeasurementId};
use crate::report::{MeasurementResult, ResultId};

/// Measurement store trait
///
/// Backend-agnostic interface for recording measurements and their results.
///
/// # Implementations
///
/// - `MemoryStore` -- Process-local, used by tests and simulations
/// - `SqliteStore` -- Durable, file-based
pub trait MeasurementStore: Send + Sync {
    /// Record a measurement (normally already `started`).
    fn insert(&self, measurement: &Measurement) -> Result<MeasurementId>;

    /// Record a result and link it to its measurement.
    ///
    /// Fails if the measurement is unknown.
    fn insert_result(&self, result: &MeasurementResult) -> Result<ResultId>;

    /// Transition to `completed`. Returns false for unknown ids and for
    /// measurements that cannot make that transition.
    fn mark_completed(&self, id: &MeasurementId) -> Result<bool>;

    /// Transition to `failed`. Same rules as [`mark_completed`](Self::mark_completed).
    fn mark_failed(&self, id: &MeasurementId) -> Result<bool>;

    /// Load one measurement.
    fn find_by_id(&self, id: &MeasurementId) -> Result<Option<Measurement>>;

    /// All results linked to a measurement, oldest first.
    fn results_for(&self, id: &MeasurementId) -> Result<Vec<MeasurementResult>>;

    /// All measurements, oldest first.
    fn list(&self) -> Result<Vec<Measurement>>;
}
