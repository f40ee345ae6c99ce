//! On/off drivers for controllable devices.
//!
//! The set of drivers is closed: each configured device gets exactly one
//! [`ActuatorDriver`] variant when the registry is built, and callers only see
//! the [`Actuator`] capability.

use crate::config::ActuatorDriverConfig;
use crate::devices::plug::TasmotaPlug;
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub enum ActuationError {
    UnknownDevice(String),
    NotAnActuator(String),
    Io(std::io::Error),
    Timeout,
    Transport(String),
    Http { status: u16 },
    Json(serde_json::Error),
    /// The device answered, but not with the state we asked for.
    Protocol(String),
}

impl Display for ActuationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ActuationError::UnknownDevice(id) => write!(f, "unknown device {}", id),
            ActuationError::NotAnActuator(id) => write!(f, "device {} cannot be switched", id),
            ActuationError::Io(e) => write!(f, "io error: {}", e),
            ActuationError::Timeout => write!(f, "device did not answer in time"),
            ActuationError::Transport(s) => write!(f, "transport error: {}", s),
            ActuationError::Http { status } => write!(f, "http {}", status),
            ActuationError::Json(e) => write!(f, "json error: {}", e),
            ActuationError::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl Error for ActuationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ActuationError::Io(e) => Some(e),
            ActuationError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ActuationError {
    fn from(value: std::io::Error) -> Self {
        ActuationError::Io(value)
    }
}

impl From<serde_json::Error> for ActuationError {
    fn from(value: serde_json::Error) -> Self {
        ActuationError::Json(value)
    }
}

/// Anything that can be switched on and off.
pub trait Actuator {
    fn set_state(&self, on: bool) -> Result<(), ActuationError>;
}

#[derive(Debug)]
pub enum ActuatorDriver {
    Relay(GpioRelay),
    Tasmota(TasmotaPlug),
    Virtual(VirtualSwitch),
}

impl ActuatorDriver {
    pub fn from_config(config: &ActuatorDriverConfig, timeout: Duration) -> Self {
        match config {
            ActuatorDriverConfig::Relay { path, active_low } => ActuatorDriver::Relay(GpioRelay {
                path: path.clone(),
                active_low: *active_low,
            }),
            ActuatorDriverConfig::Tasmota { host } => ActuatorDriver::Tasmota(TasmotaPlug::new(host, timeout)),
            ActuatorDriverConfig::Virtual => ActuatorDriver::Virtual(VirtualSwitch::default()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActuatorDriver::Relay(_) => "relay",
            ActuatorDriver::Tasmota(_) => "tasmota",
            ActuatorDriver::Virtual(_) => "virtual",
        }
    }
}

impl Actuator for ActuatorDriver {
    fn set_state(&self, on: bool) -> Result<(), ActuationError> {
        match self {
            ActuatorDriver::Relay(relay) => relay.set_state(on),
            ActuatorDriver::Tasmota(plug) => plug.set_state(on),
            ActuatorDriver::Virtual(switch) => switch.set_state(on),
        }
    }
}

/// Relay wired to a GPIO line exported through sysfs.
#[derive(Debug, Clone)]
pub struct GpioRelay {
    pub path: PathBuf,
    pub active_low: bool,
}

impl Actuator for GpioRelay {
    fn set_state(&self, on: bool) -> Result<(), ActuationError> {
        let level = on != self.active_low;
        fs::write(&self.path, if level { "1" } else { "0" })?;
        Ok(())
    }
}

/// In-memory switch; remembers the last state it was set to.
#[derive(Debug, Default)]
pub struct VirtualSwitch {
    state: Mutex<Option<bool>>,
    switches: AtomicUsize,
}

impl VirtualSwitch {
    pub fn state(&self) -> Option<bool> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many times the switch has been set, whether or not the state changed.
    pub fn switch_count(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }
}

impl Actuator for VirtualSwitch {
    fn set_state(&self, on: bool) -> Result<(), ActuationError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(on);
        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_writes_gpio_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        let relay = GpioRelay {
            path: path.clone(),
            active_low: false,
        };
        relay.set_state(true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        relay.set_state(false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn active_low_relay_inverts_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        let relay = GpioRelay {
            path: path.clone(),
            active_low: true,
        };
        relay.set_state(true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn relay_on_missing_gpio_is_an_io_error() {
        let relay = GpioRelay {
            path: PathBuf::from("/nonexistent/gpio999/value"),
            active_low: false,
        };
        assert!(matches!(relay.set_state(true), Err(ActuationError::Io(_))));
    }

    #[test]
    fn virtual_switch_remembers_state() {
        let switch = VirtualSwitch::default();
        assert_eq!(switch.state(), None);
        switch.set_state(true).unwrap();
        switch.set_state(true).unwrap();
        assert_eq!(switch.state(), Some(true));
        assert_eq!(switch.switch_count(), 2);
    }
}
