//! The set of sensors and actuators known to this process.
//!
//! Built once at startup and shared behind an `Arc`; nothing in it changes
//! afterwards, so lookups need no locking. Each actuator carries its own lock
//! so two actuations of the same device never interleave.

use crate::config::{DevicesFile, SensorSourceConfig, WidgetConfig};
use crate::db::models::device_state;
use crate::devices::actuator::{ActuationError, Actuator, ActuatorDriver};
use crate::services::device_log::DeviceLog;
use crate::utils::now_timestamp;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Sensor,
    Actuator,
}

#[derive(Debug)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    /// Metrics a sensor reports; empty for actuators.
    pub metrics: Vec<String>,
    pub source: Option<SensorSourceConfig>,
    pub actuator: Option<ActuatorDriver>,
}

impl DeviceDescriptor {
    pub fn sensor(id: &str, name: &str, metrics: Vec<String>, source: SensorSourceConfig) -> Self {
        DeviceDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            kind: DeviceKind::Sensor,
            metrics,
            source: Some(source),
            actuator: None,
        }
    }

    pub fn actuator(id: &str, name: &str, driver: ActuatorDriver) -> Self {
        DeviceDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            kind: DeviceKind::Actuator,
            metrics: Vec::new(),
            source: None,
            actuator: Some(driver),
        }
    }

    pub fn is_sensor(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_actuator(&self) -> bool {
        self.actuator.is_some()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            metrics: self.metrics.clone(),
        }
    }
}

/// What the dashboard needs to offer a device as a rule option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub metrics: Vec<String>,
}

struct Entry {
    descriptor: DeviceDescriptor,
    lock: Mutex<()>,
}

pub struct DeviceRegistry {
    entries: Vec<Entry>,
    log: DeviceLog,
}

impl DeviceRegistry {
    pub fn new(descriptors: Vec<DeviceDescriptor>, log: DeviceLog) -> Self {
        let entries = descriptors
            .into_iter()
            .map(|descriptor| Entry {
                descriptor,
                lock: Mutex::new(()),
            })
            .collect();
        DeviceRegistry { entries, log }
    }

    pub fn from_config(file: &DevicesFile, actuation_timeout: Duration, log: DeviceLog) -> Self {
        let mut descriptors = Vec::new();
        for widget in &file.devices {
            match widget {
                WidgetConfig::Sensor(s) => descriptors.push(DeviceDescriptor::sensor(
                    &s.id,
                    s.name.as_deref().unwrap_or(&s.id),
                    s.metrics.clone(),
                    s.source.clone(),
                )),
                WidgetConfig::Device(d) => {
                    let driver = ActuatorDriver::from_config(&d.driver, actuation_timeout);
                    info!("Registry: actuator {} ({})", d.id, driver.kind());
                    descriptors.push(DeviceDescriptor::actuator(
                        &d.id,
                        d.name.as_deref().unwrap_or(&d.id),
                        driver,
                    ));
                }
                WidgetConfig::Control(_) | WidgetConfig::Clock => {}
            }
        }
        Self::new(descriptors, log)
    }

    pub fn find(&self, device_id: &str) -> Option<&DeviceDescriptor> {
        self.entry(device_id).map(|e| &e.descriptor)
    }

    fn entry(&self, device_id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.descriptor.id == device_id)
    }

    pub fn list_sensors(&self) -> Vec<&DeviceDescriptor> {
        self.descriptors().filter(|d| d.is_sensor()).collect()
    }

    pub fn list_actuators(&self) -> Vec<&DeviceDescriptor> {
        self.descriptors().filter(|d| d.is_actuator()).collect()
    }

    fn descriptors(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    /// Switch a device and record the change.
    ///
    /// Returns false, without writing to the log, when the device is unknown,
    /// is not an actuator, or the driver fails. Failures are logged here and
    /// never propagate.
    pub fn actuate(&self, device_id: &str, on: bool) -> bool {
        match self.try_actuate(device_id, on) {
            Ok(()) => true,
            Err(e) => {
                error!("Switching device {} {} failed: {}", device_id, device_state::from_bool(on), e);
                false
            }
        }
    }

    /// The device lock is held from timestamping until the log entry is written,
    /// so log order always matches switching order.
    fn try_actuate(&self, device_id: &str, on: bool) -> Result<(), ActuationError> {
        let entry = self
            .entry(device_id)
            .ok_or_else(|| ActuationError::UnknownDevice(device_id.to_string()))?;
        let driver = entry
            .descriptor
            .actuator
            .as_ref()
            .ok_or_else(|| ActuationError::NotAnActuator(device_id.to_string()))?;
        let _guard = entry.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let ts = now_timestamp();
        let state = device_state::from_bool(on);
        driver.set_state(on)?;
        info!("Device {} switched {}", device_id, state);
        if let Err(e) = self.log.append(&ts, device_id, on) {
            warn!("Device {} switched {} but the log write failed: {}", device_id, state, e);
        }
        Ok(())
    }
}
