//! Sampling sources for environmental sensors.

use crate::config::SensorSourceConfig;
use chrono::{DateTime, Datelike, Timelike, Utc};
use core::fmt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::f64::consts::PI;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

pub const METRIC_TEMPERATURE: &str = "temperature_C";
pub const METRIC_HUMIDITY: &str = "humidity_RH";

#[derive(Debug)]
pub enum SensorError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, raw: String },
    UnsupportedMetric(String),
}

impl Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Io { path, source } => write!(f, "failed to read {}: {}", path.display(), source),
            SensorError::Parse { path, raw } => write!(f, "unexpected contents in {}: {:?}", path.display(), raw),
            SensorError::UnsupportedMetric(m) => write!(f, "metric {} is not provided by this source", m),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub enum SensorSource {
    Hwmon(HwmonSensor),
    Simulated(SimulatedSensor),
}

impl SensorSource {
    pub fn from_config(config: &SensorSourceConfig) -> Self {
        match config {
            SensorSourceConfig::Hwmon { path } => SensorSource::Hwmon(HwmonSensor { dir: path.clone() }),
            SensorSourceConfig::Simulated { seed } => SensorSource::Simulated(SimulatedSensor::new(*seed)),
        }
    }

    /// Read the current value of one metric.
    pub fn sample(&mut self, metric: &str, now: DateTime<Utc>) -> Result<f64, SensorError> {
        match self {
            SensorSource::Hwmon(s) => s.sample(metric),
            SensorSource::Simulated(s) => s.sample(metric, now),
        }
    }
}

/// A hwmon directory such as the one the kernel's `sht4x` driver exposes.
/// Values are integers in milli-units.
pub struct HwmonSensor {
    dir: PathBuf,
}

impl HwmonSensor {
    fn sample(&self, metric: &str) -> Result<f64, SensorError> {
        let file = match metric {
            METRIC_TEMPERATURE => "temp1_input",
            METRIC_HUMIDITY => "humidity1_input",
            other => return Err(SensorError::UnsupportedMetric(other.to_string())),
        };
        read_milli(&self.dir.join(file))
    }
}

fn read_milli(path: &Path) -> Result<f64, SensorError> {
    let raw = fs::read_to_string(path).map_err(|source| SensorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim()
        .parse::<i64>()
        .map(|v| v as f64 / 1000.0)
        .map_err(|_| SensorError::Parse {
            path: path.to_path_buf(),
            raw: raw.trim().to_string(),
        })
}

/// Indoor climate with a daily cycle and noise, for demos without hardware.
pub struct SimulatedSensor {
    rng: SmallRng,
}

impl SimulatedSensor {
    pub fn new(seed: u64) -> Self {
        SimulatedSensor {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn sample(&mut self, metric: &str, now: DateTime<Utc>) -> Result<f64, SensorError> {
        let day_fraction = now.num_seconds_from_midnight() as f64 / 86_400.0;
        let annual_fraction = now.ordinal0() as f64 / 365.0;
        match metric {
            METRIC_TEMPERATURE => Ok(self.temperature(day_fraction, annual_fraction)),
            METRIC_HUMIDITY => {
                let temperature = self.temperature(day_fraction, annual_fraction);
                Ok(self.humidity(temperature, annual_fraction))
            }
            other => Err(SensorError::UnsupportedMetric(other.to_string())),
        }
    }

    fn temperature(&mut self, day_fraction: f64, annual_fraction: f64) -> f64 {
        let seasonal = (annual_fraction * 2.0 * PI).sin() * 2.5;
        let diurnal = ((day_fraction - 0.3) * 2.0 * PI).sin() * 2.0;
        let random = self.rng.random_range(-0.3..=0.3);
        (22.0 + seasonal + diurnal + random).clamp(15.0, 32.0)
    }

    fn humidity(&mut self, temperature: f64, annual_fraction: f64) -> f64 {
        let seasonal = ((annual_fraction + 0.1) * 2.0 * PI).cos() * 8.0;
        let temperature_component = (22.0 - temperature) * 1.5;
        let random = self.rng.random_range(-2.0..=2.0);
        (50.0 + seasonal + temperature_component + random).clamp(20.0, 85.0)
    }
}
