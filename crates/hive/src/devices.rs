//! Per-device data and the connect gate.
//!
//! A device is "known" from its first connect until it disconnects. While
//! known it has a [`DeviceRecord`] holding its config, schedule, the state
//! it last reported and its mentor behavior history. Mentor behaviors and
//! `persist` data survive disconnects in `{state_dir}/devices/{id}.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hiveproto::RobotSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Data held for a connected device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub config: Value,
    pub schedule: Value,
    pub mentor_behaviors: Vec<Value>,
    pub state: Value,
    pub puppet_state: Option<Value>,
    pub persist: Value,
    pub connected_at: DateTime<Utc>,
}

/// The part of a record that outlives a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PersistedDevice {
    #[serde(default)]
    mentor_behaviors: Vec<Value>,
    #[serde(default)]
    persist: Value,
}

#[derive(Debug, Clone)]
struct Defaults {
    config: Value,
    schedule: Value,
}

pub struct DeviceStore {
    gate: DashMap<String, DateTime<Utc>>,
    records: DashMap<String, DeviceRecord>,
    defaults: RwLock<Defaults>,
    client_metrics: DashMap<String, i64>,
    state_dir: Option<PathBuf>,
}

impl DeviceStore {
    pub fn new(config: Value, schedule: Value) -> Self {
        Self {
            gate: DashMap::new(),
            records: DashMap::new(),
            defaults: RwLock::new(Defaults { config, schedule }),
            client_metrics: DashMap::new(),
            state_dir: None,
        }
    }

    /// Persist mentor behaviors under `dir`.
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = Some(dir.join("devices"));
        self
    }

    /// Replace the config and schedule handed to devices, including the
    /// ones already connected.
    pub fn set_defaults(&self, config: Value, schedule: Value) {
        for mut record in self.records.iter_mut() {
            record.config = config.clone();
            record.schedule = schedule.clone();
        }
        let defaults = Defaults { config, schedule };
        match self.defaults.write() {
            Ok(mut guard) => *guard = defaults,
            Err(poisoned) => *poisoned.into_inner() = defaults,
        }
    }

    fn defaults(&self) -> Defaults {
        match self.defaults.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True exactly once per connect: the first caller after the device was
    /// absent flips the gate and must run the bootstrap.
    pub fn connect_init_needed(&self, device_id: &str) -> bool {
        match self.gate.entry(device_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.gate.contains_key(device_id)
    }

    pub fn online_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gate.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Load the device's record if it is not loaded yet.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        if self.records.contains_key(device_id) {
            debug!(device.id = device_id, "Device already known");
            return Ok(());
        }

        let persisted = self.read_persisted(device_id).await?;
        let defaults = self.defaults();
        info!(
            device.id = device_id,
            mentor_behaviors = persisted.mentor_behaviors.len(),
            "Loaded device record"
        );
        self.records
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                config: defaults.config,
                schedule: defaults.schedule,
                mentor_behaviors: persisted.mentor_behaviors,
                state: Value::Null,
                puppet_state: None,
                persist: persisted.persist,
                connected_at: Utc::now(),
            });
        Ok(())
    }

    /// Drop everything held for a disconnected device and reopen its gate.
    pub fn release(&self, device_id: &str) {
        self.gate.remove(device_id);
        if self.records.remove(device_id).is_some() {
            info!(device.id = device_id, "Released device data");
        }
    }

    pub fn record(&self, device_id: &str) -> Option<DeviceRecord> {
        self.records.get(device_id).map(|r| r.clone())
    }

    pub fn config(&self, device_id: &str) -> Value {
        self.records
            .get(device_id)
            .map(|r| r.config.clone())
            .unwrap_or_else(|| self.defaults().config)
    }

    pub fn schedule(&self, device_id: &str) -> Value {
        self.records
            .get(device_id)
            .map(|r| r.schedule.clone())
            .unwrap_or_else(|| self.defaults().schedule)
    }

    pub fn mentor_behaviors(&self, device_id: &str) -> Vec<Value> {
        self.records
            .get(device_id)
            .map(|r| r.mentor_behaviors.clone())
            .unwrap_or_default()
    }

    /// Record a completed mentor behavior and persist the history.
    pub async fn add_mentor_behavior(&self, device_id: &str, behavior: Value) -> Result<()> {
        let snapshot = {
            let Some(mut record) = self.records.get_mut(device_id) else {
                warn!(device.id = device_id, "Mentor behavior for unknown device dropped");
                return Ok(());
            };
            record.mentor_behaviors.push(behavior);
            PersistedDevice {
                mentor_behaviors: record.mentor_behaviors.clone(),
                persist: record.persist.clone(),
            }
        };
        self.write_persisted(device_id, &snapshot).await
    }

    pub fn put_state(&self, device_id: &str, state: Value) {
        match self.records.get_mut(device_id) {
            Some(mut record) => record.state = state,
            None => debug!(device.id = device_id, "State for unknown device dropped"),
        }
    }

    pub fn put_puppet_state(&self, device_id: &str, state: Value) {
        if let Some(mut record) = self.records.get_mut(device_id) {
            record.puppet_state = Some(state);
        }
    }

    /// Data attached to every volley for the device.
    pub fn robot_snapshot(&self, device_id: &str) -> RobotSnapshot {
        match self.records.get(device_id) {
            Some(r) => RobotSnapshot {
                config: r.config.clone(),
                state: r.state.clone(),
                persist: r.persist.clone(),
            },
            None => RobotSnapshot {
                config: self.defaults().config,
                ..Default::default()
            },
        }
    }

    pub fn record_client_metric(&self, metric: &str, value: i64) {
        self.client_metrics.insert(metric.to_string(), value);
    }

    pub fn client_metrics(&self) -> BTreeMap<String, i64> {
        self.client_metrics
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn persisted_path(&self, device_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{device_id}.json")))
    }

    async fn read_persisted(&self, device_id: &str) -> Result<PersistedDevice> {
        let Some(path) = self.persisted_path(device_id) else {
            return Ok(PersistedDevice::default());
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse device data {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedDevice::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read device data {}", path.display())),
        }
    }

    async fn write_persisted(&self, device_id: &str, data: &PersistedDevice) -> Result<()> {
        let Some(path) = self.persisted_path(device_id) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write device data {}", path.display()))
    }
}
