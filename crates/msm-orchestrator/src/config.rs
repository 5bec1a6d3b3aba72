// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestrator configuration.
//!
//! Supports both programmatic and file-based configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::store::{MeasurementStore, MemoryStore, SqliteStore};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub store: StoreSettings,

    /// Simulated probe fleet.
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

/// Coordinator process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Coordinator name (for identification).
    #[serde(default = "default_name")]
    pub name: String,

    /// Address advertised to probes coming online.
    #[serde(default = "default_address")]
    pub address: String,

    /// Bound on every correlated wait (milliseconds).
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    "msm-orchestrator".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_reply_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: default_address(),
            reply_timeout_ms: default_reply_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl CoordinatorSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file (sqlite backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    /// Open the configured backend.
    pub fn open(&self) -> anyhow::Result<Arc<dyn MeasurementStore>> {
        Ok(match (self.backend, &self.path) {
            (StoreBackend::Memory, _) => Arc::new(MemoryStore::new()),
            (StoreBackend::Sqlite, Some(path)) => Arc::new(SqliteStore::new(path)?),
            (StoreBackend::Sqlite, None) => anyhow::bail!("sqlite store needs a path"),
        })
    }
}

/// One simulated probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub id: String,
    pub address: IpAddr,
    pub clock_sync_address: IpAddr,

    /// Commands to reject, with the NACK reason.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nack: BTreeMap<String, String>,

    /// Commands never answered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub silent: Vec<String>,
}

impl ProbeConfig {
    pub fn new(id: impl Into<String>, address: IpAddr, clock_sync_address: IpAddr) -> Self {
        Self {
            id: id.into(),
            address,
            clock_sync_address,
            nack: BTreeMap::new(),
            silent: Vec::new(),
        }
    }

    /// Reject `command` with `reason`.
    pub fn nack(mut self, command: impl Into<String>, reason: impl Into<String>) -> Self {
        self.nack.insert(command.into(), reason.into());
        self
    }

    /// Never answer `command`.
    pub fn silent(mut self, command: impl Into<String>) -> Self {
        self.silent.push(command.into());
        self
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.name.is_empty() {
            return Err(ConfigError::Invalid("Coordinator name is empty".into()));
        }
        if self.coordinator.address.is_empty() {
            return Err(ConfigError::Invalid("Coordinator address is empty".into()));
        }
        if self.coordinator.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid("reply_timeout_ms must be positive".into()));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(ConfigError::Invalid("sqlite store requires a path".into()));
        }

        let mut seen = HashSet::new();
        for (i, probe) in self.probes.iter().enumerate() {
            if probe.id.is_empty() {
                return Err(ConfigError::Invalid(format!("Probe {} has an empty id", i)));
            }
            if !seen.insert(probe.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Probe '{}' is declared twice",
                    probe.id
                )));
            }
        }

        Ok(())
    }

    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.coordinator.name = name.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.coordinator.address = address.into();
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.coordinator.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sqlite(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store = StoreSettings {
            backend: StoreBackend::Sqlite,
            path: Some(path.into()),
        };
        self
    }

    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.config.probes.push(probe);
        self
    }

    pub fn build(self) -> Result<OrchestratorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
