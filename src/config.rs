//! Runtime configuration: process settings from the environment and the
//! static device list from a YAML file.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATABASE_PATH: &str = "data.db";
pub const DEFAULT_DEVICES_FILE: &str = "config.yaml";
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_CONTROL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CONTROL_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_SENSOR_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ACTUATION_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HISTORY_HOURS: u32 = 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub devices_file: PathBuf,
    pub http_bind: String,
    /// Pause between two full evaluations of a control rule.
    pub control_interval: Duration,
    /// Shorter pause used while a rule is disabled or its sensor has no data yet.
    pub control_backoff: Duration,
    pub sensor_interval: Duration,
    /// Upper bound for one networked actuation.
    pub actuation_timeout: Duration,
    /// Window of the history endpoints.
    pub history_hours: u32,
    /// Allow running without touching sensor hardware (e.g. on a dev machine).
    pub sensors_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
        let devices_file = std::env::var("DEVICES_FILE").unwrap_or_else(|_| DEFAULT_DEVICES_FILE.to_string());
        let http_bind = std::env::var("HTTP_BIND").unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string());

        let sensors_enabled = std::env::var("SENSORS_ENABLED")
            .ok()
            .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(true);

        let history_hours = match std::env::var("HISTORY_HOURS") {
            Ok(s) if !s.trim().is_empty() => s
                .trim()
                .parse::<u32>()
                .map_err(|_| "HISTORY_HOURS must be a non-negative integer".to_string())?,
            _ => DEFAULT_HISTORY_HOURS,
        };

        Ok(Config {
            database_path,
            devices_file: PathBuf::from(devices_file),
            http_bind,
            control_interval: secs_from_env("CONTROL_INTERVAL_SECS", DEFAULT_CONTROL_INTERVAL_SECS)?,
            control_backoff: secs_from_env("CONTROL_BACKOFF_SECS", DEFAULT_CONTROL_BACKOFF_SECS)?,
            sensor_interval: secs_from_env("SENSOR_INTERVAL_SECS", DEFAULT_SENSOR_INTERVAL_SECS)?,
            actuation_timeout: secs_from_env("ACTUATION_TIMEOUT_SECS", DEFAULT_ACTUATION_TIMEOUT_SECS)?,
            history_hours,
            sensors_enabled,
        })
    }
}

fn secs_from_env(name: &str, default: u64) -> Result<Duration, String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(format!("{} must be a positive number of seconds", name)),
            Ok(v) => Ok(Duration::from_secs(v)),
        },
        _ => Ok(Duration::from_secs(default)),
    }
}

/// Contents of the devices file.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesFile {
    pub devices: Vec<WidgetConfig>,
}

/// One dashboard widget. The `widget` tag selects what the entry describes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "widget", rename_all = "snake_case")]
pub enum WidgetConfig {
    Sensor(SensorConfig),
    Device(ActuatorConfig),
    Control(ControlConfig),
    Clock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source: SensorSourceConfig,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorSourceConfig {
    /// A hwmon sysfs directory, e.g. `/sys/class/hwmon/hwmon2`.
    Hwmon { path: PathBuf },
    Simulated {
        #[serde(default)]
        seed: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub driver: ActuatorDriverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActuatorDriverConfig {
    /// GPIO relay driven through its sysfs `value` file.
    Relay {
        path: PathBuf,
        #[serde(default)]
        active_low: bool,
    },
    /// Smart plug running Tasmota firmware, reachable over HTTP.
    Tasmota { host: String },
    Virtual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub defaults: ControlDefaults,
}

/// Values a control's rule starts out with before anyone edits it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlDefaults {
    pub sensor_id: String,
    pub device_id: String,
    pub metric: String,
    pub operator: String,
    pub target_value: f64,
    pub enabled: bool,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        ControlDefaults {
            sensor_id: String::new(),
            device_id: String::new(),
            metric: String::new(),
            operator: crate::services::rules::DEFAULT_OPERATOR.to_string(),
            target_value: 0.0,
            enabled: false,
        }
    }
}

impl DevicesFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let file: DevicesFile = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for widget in &self.devices {
            let id = match widget {
                WidgetConfig::Sensor(s) => &s.id,
                WidgetConfig::Device(d) => &d.id,
                WidgetConfig::Control(c) => &c.id,
                WidgetConfig::Clock => continue,
            };
            if id.trim().is_empty() {
                return Err("device id cannot be empty".to_string());
            }
            if !seen.insert(id.as_str()) {
                return Err(format!("duplicate device id: {}", id));
            }
        }
        Ok(())
    }

    pub fn controls(&self) -> impl Iterator<Item = &ControlConfig> {
        self.devices.iter().filter_map(|w| match w {
            WidgetConfig::Control(c) => Some(c),
            _ => None,
        })
    }

    pub fn has_clock(&self) -> bool {
        self.devices.iter().any(|w| matches!(w, WidgetConfig::Clock))
    }
}
