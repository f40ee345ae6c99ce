use crate::devices::sensor::SensorSource;
use crate::services::readings::ReadingStore;
use crate::shutdown::ShutdownToken;
use crate::utils::format_timestamp;
use chrono::Utc;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Periodically samples one sensor and stores a reading per metric.
pub struct SensorPoller {
    pub sensor_id: String,
    pub metrics: Vec<String>,
    pub source: SensorSource,
    pub readings: ReadingStore,
}

impl SensorPoller {
    /// Take one sample of every metric; returns how many readings were stored.
    pub fn poll_once(&mut self) -> usize {
        let now = Utc::now();
        let ts = format_timestamp(now);
        let mut stored = 0;
        for metric in &self.metrics {
            let value = match self.source.sample(metric, now) {
                Ok(v) => v,
                Err(e) => {
                    warn!("[{}] Sampling {} failed: {}", self.sensor_id, metric, e);
                    continue;
                }
            };
            match self.readings.insert(&self.sensor_id, &ts, metric, value) {
                Ok(()) => {
                    debug!("[{}] {} = {}", self.sensor_id, metric, value);
                    stored += 1;
                }
                Err(e) => warn!("[{}] Storing {} failed: {}", self.sensor_id, metric, e),
            }
        }
        stored
    }

    pub fn run_loop(mut self, interval: Duration, shutdown: &ShutdownToken) {
        info!(
            "[{}] Sensor poller started (metrics={}, interval={}s)",
            self.sensor_id,
            self.metrics.join(","),
            interval.as_secs()
        );
        loop {
            let tick_start = Instant::now();
            self.poll_once();

            // Maintain steady cadence
            let elapsed = tick_start.elapsed();
            if !shutdown.sleep(interval.saturating_sub(elapsed)) {
                break;
            }
        }
        info!("[{}] Sensor poller stopped", self.sensor_id);
    }
}
