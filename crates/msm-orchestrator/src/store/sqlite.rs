// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite measurement backend
//!
//! Durable storage for measurements and their results.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::MeasurementStore;
use crate::measurement::{Measurement, MeasurementId, MeasurementState};
use crate::report::{MeasurementResult, ResultId};

/// SQLite measurement store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE measurements (
///     seq INTEGER PRIMARY KEY AUTOINCREMENT,
///     id TEXT NOT NULL UNIQUE,
///     kind TEXT NOT NULL,
///     state TEXT NOT NULL,
///     body TEXT NOT NULL          -- JSON, without the result list
/// );
/// CREATE TABLE results (
///     seq INTEGER PRIMARY KEY AUTOINCREMENT,
///     id TEXT NOT NULL UNIQUE,
///     measurement_id TEXT NOT NULL REFERENCES measurements(id),
///     body TEXT NOT NULL          -- JSON
/// );
/// CREATE INDEX idx_results_measurement ON results(measurement_id);
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-based database.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS measurements (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                measurement_id TEXT NOT NULL REFERENCES measurements(id),
                body TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_results_measurement ON results(measurement_id)",
            [],
        )?;

        Ok(())
    }

    fn load(conn: &Connection, id: &MeasurementId) -> Result<Option<Measurement>> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM measurements WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Ok(None);
        };

        let mut measurement: Measurement = serde_json::from_str(&body)
            .with_context(|| format!("Corrupt measurement record {}", id))?;

        let mut stmt =
            conn.prepare("SELECT id FROM results WHERE measurement_id = ?1 ORDER BY seq ASC")?;
        let ids = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        measurement.results = ids
            .iter()
            .map(|raw| serde_json::from_value(serde_json::Value::String(raw.clone())))
            .collect::<Result<Vec<ResultId>, _>>()?;

        Ok(Some(measurement))
    }

    fn store(conn: &Connection, measurement: &Measurement) -> Result<()> {
        let mut record = measurement.clone();
        // Links live in the results table.
        record.results.clear();
        conn.execute(
            "UPDATE measurements SET state = ?2, body = ?3 WHERE id = ?1",
            params![
                measurement.id.to_string(),
                measurement.state.as_str(),
                serde_json::to_string(&record)?,
            ],
        )?;
        Ok(())
    }

    fn transition(&self, id: &MeasurementId, next: MeasurementState) -> Result<bool> {
        let conn = self.lock()?;
        let Some(mut measurement) = Self::load(&conn, id)? else {
            return Ok(false);
        };
        if !measurement.transition(next) {
            return Ok(false);
        }
        Self::store(&conn, &measurement)?;
        Ok(true)
    }
}

impl MeasurementStore for SqliteStore {
    fn insert(&self, measurement: &Measurement) -> Result<MeasurementId> {
        let conn = self.lock()?;
        let mut record = measurement.clone();
        record.results.clear();
        conn.execute(
            "INSERT INTO measurements (id, kind, state, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                measurement.id.to_string(),
                measurement.kind().as_str(),
                measurement.state.as_str(),
                serde_json::to_string(&record)?,
            ],
        )
        .with_context(|| format!("Failed to insert measurement {}", measurement.id))?;
        Ok(measurement.id)
    }

    fn insert_result(&self, result: &MeasurementResult) -> Result<ResultId> {
        let conn = self.lock()?;
        let known: Option<i64> = conn
            .query_row(
                "SELECT seq FROM measurements WHERE id = ?1",
                [result.measurement_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            bail!(
                "result {} references unknown measurement {}",
                result.id,
                result.measurement_id
            );
        }
        conn.execute(
            "INSERT INTO results (id, measurement_id, body) VALUES (?1, ?2, ?3)",
            params![
                result.id.to_string(),
                result.measurement_id.to_string(),
                serde_json::to_string(result)?,
            ],
        )?;
        Ok(result.id)
    }

    fn mark_completed(&self, id: &MeasurementId) -> Result<bool> {
        self.transition(id, MeasurementState::Completed)
    }

    fn mark_failed(&self, id: &MeasurementId) -> Result<bool> {
        self.transition(id, MeasurementState::Failed)
    }

    fn find_by_id(&self, id: &MeasurementId) -> Result<Option<Measurement>> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    fn results_for(&self, id: &MeasurementId) -> Result<Vec<MeasurementResult>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM results WHERE measurement_id = ?1 ORDER BY seq ASC")?;
        let bodies = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt result record"))
            .collect()
    }

    fn list(&self) -> Result<Vec<Measurement>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM measurements ORDER BY seq ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut all = Vec::with_capacity(ids.len());
        for raw in ids {
            let id: MeasurementId = raw
                .parse()
                .with_context(|| format!("Corrupt measurement id {}", raw))?;
            if let Some(m) = Self::load(&conn, &id)? {
                all.push(m);
            }
        }
        Ok(all)
    }
}
