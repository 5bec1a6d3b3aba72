// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory measurement store.

use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::MeasurementStore;
use crate::measurement::{Measurement, MeasurementId, MeasurementState};
use crate::report::{MeasurementResult, ResultId};

#[derive(Default)]
struct Inner {
    measurements: HashMap<MeasurementId, Measurement>,
    /// Insertion order of measurements.
    order: Vec<MeasurementId>,
    results: HashMap<MeasurementId, Vec<MeasurementResult>>,
}

/// Process-local store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(&self, id: &MeasurementId, next: MeasurementState) -> bool {
        let mut inner = self.inner.write();
        match inner.measurements.get_mut(id) {
            Some(m) => m.transition(next),
            None => false,
        }
    }
}

impl MeasurementStore for MemoryStore {
    fn insert(&self, measurement: &Measurement) -> Result<MeasurementId> {
        let mut inner = self.inner.write();
        if inner.measurements.contains_key(&measurement.id) {
            bail!("measurement {} already recorded", measurement.id);
        }
        inner.order.push(measurement.id);
        inner
            .measurements
            .insert(measurement.id, measurement.clone());
        Ok(measurement.id)
    }

    fn insert_result(&self, result: &MeasurementResult) -> Result<ResultId> {
        let mut inner = self.inner.write();
        let Some(m) = inner.measurements.get_mut(&result.measurement_id) else {
            bail!("result {} references unknown measurement {}", result.id, result.measurement_id);
        };
        m.results.push(result.id);
        inner
            .results
            .entry(result.measurement_id)
            .or_default()
            .push(result.clone());
        Ok(result.id)
    }

    fn mark_completed(&self, id: &MeasurementId) -> Result<bool> {
        Ok(self.transition(id, MeasurementState::Completed))
    }

    fn mark_failed(&self, id: &MeasurementId) -> Result<bool> {
        Ok(self.transition(id, MeasurementState::Failed))
    }

    fn find_by_id(&self, id: &MeasurementId) -> Result<Option<Measurement>> {
        Ok(self.inner.read().measurements.get(id).cloned())
    }

    fn results_for(&self, id: &MeasurementId) -> Result<Vec<MeasurementResult>> {
        Ok(self
            .inner
            .read()
            .results
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn list(&self) -> Result<Vec<Measurement>> {
        let inner = self.inner.read();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.measurements.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests as shared;

    #[test]
    fn test_lifecycle() {
        shared::lifecycle_is_monotonic(&MemoryStore::new());
    }

    #[test]
    fn test_results() {
        shared::results_are_linked(&MemoryStore::new());
    }

    #[test]
    fn test_list() {
        let store = MemoryStore::new();
        shared::list_returns_everything(&store);
        assert_eq!(store.len(), 2);
    }
}
