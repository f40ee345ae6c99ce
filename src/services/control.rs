//! Rule evaluation loop for control widgets.
//!
//! Each control instance runs its own thread. Every tick re-reads the rule
//! from the store (there is no change notification), so an edit takes effect
//! within one interval. While the rule is disabled or its sensor has no data
//! the loop polls on the shorter backoff instead.
//!
//! Manual overrides go straight to the registry and are not remembered: the
//! next tick of any control that governs the same device recomputes its
//! state and may switch it back.

use crate::config::ControlDefaults;
use crate::db::models::ControlRule;
use crate::db::pool::StorageError;
use crate::devices::registry::DeviceRegistry;
use crate::services::readings::ReadingStore;
use crate::services::rules::RuleStore;
use crate::shutdown::ShutdownToken;
use log::{debug, error, info};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Absolute tolerance of the `=` operator.
pub const EQUALITY_EPSILON: f64 = 0.01;

pub const OPERATORS: [&str; 5] = [">", ">=", "<", "<=", "="];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Comparison::Greater),
            ">=" => Ok(Comparison::GreaterOrEqual),
            "<" => Ok(Comparison::Less),
            "<=" => Ok(Comparison::LessOrEqual),
            "=" => Ok(Comparison::Equal),
            other => Err(format!("unknown operator {:?}", other)),
        }
    }
}

impl Comparison {
    pub fn holds(self, current: f64, target: f64) -> bool {
        match self {
            Comparison::Greater => current > target,
            Comparison::GreaterOrEqual => current >= target,
            Comparison::Less => current < target,
            Comparison::LessOrEqual => current <= target,
            Comparison::Equal => (current - target).abs() < EQUALITY_EPSILON,
        }
    }
}

/// Whether the device should be on. Unknown operators never switch anything on.
pub fn evaluate(operator: &str, current: f64, target: f64) -> bool {
    operator
        .parse::<Comparison>()
        .map(|c| c.holds(current, target))
        .unwrap_or(false)
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Rule is disabled.
    Disabled,
    /// Rule is enabled but lacks a sensor, device or metric.
    Incomplete,
    /// No reading exists yet for the rule's sensor metric.
    AwaitingReading,
    Actuated { value: f64, on: bool, success: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTimings {
    pub interval: Duration,
    pub backoff: Duration,
}

impl Tick {
    fn next_delay(&self, timings: &LoopTimings) -> Duration {
        match self {
            Tick::Disabled | Tick::Incomplete | Tick::AwaitingReading => timings.backoff,
            Tick::Actuated { .. } => timings.interval,
        }
    }
}

/// Everything a control needs to evaluate its rule.
#[derive(Clone)]
pub struct Control {
    pub control_id: String,
    pub defaults: ControlDefaults,
    pub rules: RuleStore,
    pub readings: ReadingStore,
    pub registry: Arc<DeviceRegistry>,
}

impl Control {
    pub fn rule(&self) -> Result<ControlRule, StorageError> {
        self.rules.get_config(&self.control_id, &self.defaults)
    }

    pub fn tick(&self) -> Result<Tick, StorageError> {
        let rule = self.rule()?;
        if !rule.enabled {
            return Ok(Tick::Disabled);
        }
        if !rule.is_complete() {
            return Ok(Tick::Incomplete);
        }

        let Some((ts, value)) = self.readings.latest(&rule.sensor_id, &rule.metric)? else {
            return Ok(Tick::AwaitingReading);
        };

        let on = evaluate(&rule.operator, value, rule.target_value);
        debug!(
            "[{}] {}/{} = {} (at {}) {} {} -> {}",
            self.control_id,
            rule.sensor_id,
            rule.metric,
            value,
            ts,
            rule.operator,
            rule.target_value,
            if on { "on" } else { "off" }
        );
        let success = self.registry.actuate(&rule.device_id, on);
        Ok(Tick::Actuated { value, on, success })
    }

    /// Run ticks until shutdown is requested.
    pub fn run_loop(&self, timings: LoopTimings, shutdown: &ShutdownToken) {
        info!(
            "[{}] Control loop started (interval={}s, backoff={}s)",
            self.control_id,
            timings.interval.as_secs(),
            timings.backoff.as_secs()
        );
        loop {
            let delay = match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(tick)) => {
                    if let Tick::Actuated { success: false, .. } = tick {
                        error!("[{}] Actuation failed; retrying next interval", self.control_id);
                    }
                    tick.next_delay(&timings)
                }
                Ok(Err(e)) => {
                    error!("[{}] Tick failed: {}", self.control_id, e);
                    timings.interval
                }
                Err(_) => {
                    error!("[{}] Tick panicked", self.control_id);
                    timings.interval
                }
            };
            if !shutdown.sleep(delay) {
                break;
            }
        }
        info!("[{}] Control loop stopped", self.control_id);
    }
}

/// Switch a device on request, bypassing any rule.
pub fn manual_control(registry: &DeviceRegistry, device_id: &str, action: &str) -> bool {
    info!("Manual override: {} -> {}", device_id, action);
    registry.actuate(device_id, action == "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::testing::{TestDb, test_db};
    use crate::devices::registry::tests::{test_registry, virtual_switch};
    use crate::services::rules::RuleUpdate;
    use crate::shutdown::ShutdownHandle;
    use crate::utils::now_timestamp;
    use std::time::Instant;

    #[test]
    fn operator_truth_table() {
        let cases = [
            (">", 26.0, 25.0, true),
            (">", 25.0, 25.0, false),
            (">=", 25.0, 25.0, true),
            (">=", 24.9, 25.0, false),
            ("<", 24.0, 25.0, true),
            ("<", 25.0, 25.0, false),
            ("<=", 25.0, 25.0, true),
            ("<=", 25.1, 25.0, false),
            ("=", 20.004, 20.0, true),
            ("=", 19.996, 20.0, true),
            ("=", 20.011, 20.0, false),
            ("=", 19.989, 20.0, false),
        ];
        for (op, current, target, expected) in cases {
            assert_eq!(evaluate(op, current, target), expected, "{} {} {}", current, op, target);
        }
    }

    #[test]
    fn unknown_operators_are_always_off() {
        for op in ["", "!=", "==", "=>", " >", "gt"] {
            assert!(!evaluate(op, 100.0, 0.0), "{:?}", op);
            assert!(!evaluate(op, 0.0, 0.0), "{:?}", op);
        }
    }

    fn control(db: &TestDb) -> Control {
        Control {
            control_id: "fan_control".into(),
            defaults: ControlDefaults::default(),
            rules: RuleStore::new(db.pool.clone()),
            readings: ReadingStore::new(db.pool.clone()),
            registry: Arc::new(test_registry(db)),
        }
    }

    fn enable(control: &Control, enabled: bool) {
        control
            .rules
            .update_config(
                &control.control_id,
                RuleUpdate {
                    sensor_id: "s1".into(),
                    device_id: "d1".into(),
                    metric: "temperature_C".into(),
                    operator: Some(">".into()),
                    target_value: 25.0,
                    enabled,
                },
            )
            .unwrap();
    }

    fn record(control: &Control, value: f64) {
        control
            .readings
            .insert("s1", &now_timestamp(), "temperature_C", value)
            .unwrap();
    }

    #[test]
    fn threshold_rule_drives_the_device() {
        let db = test_db();
        let control = control(&db);
        enable(&control, true);
        let switch = virtual_switch(&control.registry, "d1");

        assert_eq!(control.tick().unwrap(), Tick::AwaitingReading);
        assert_eq!(switch.switch_count(), 0);

        record(&control, 26.0);
        assert_eq!(
            control.tick().unwrap(),
            Tick::Actuated {
                value: 26.0,
                on: true,
                success: true
            }
        );
        assert_eq!(switch.state(), Some(true));

        std::thread::sleep(Duration::from_millis(2));
        record(&control, 24.0);
        assert_eq!(
            control.tick().unwrap(),
            Tick::Actuated {
                value: 24.0,
                on: false,
                success: true
            }
        );
        assert_eq!(switch.state(), Some(false));
        assert_eq!(control.registry.log().entries("d1").unwrap().len(), 2);
    }

    #[test]
    fn disabled_rule_leaves_device_alone() {
        let db = test_db();
        let control = control(&db);
        enable(&control, false);
        record(&control, 30.0);

        assert_eq!(control.tick().unwrap(), Tick::Disabled);
        assert_eq!(virtual_switch(&control.registry, "d1").switch_count(), 0);
        assert!(control.registry.log().entries("d1").unwrap().is_empty());
    }

    #[test]
    fn seeded_rule_is_disabled_until_configured() {
        let db = test_db();
        let control = control(&db);
        assert_eq!(control.tick().unwrap(), Tick::Disabled);
    }

    #[test]
    fn enabled_rule_without_sensor_is_incomplete() {
        let db = test_db();
        let control = control(&db);
        control
            .rules
            .update_config(
                &control.control_id,
                RuleUpdate {
                    device_id: "d1".into(),
                    metric: "temperature_C".into(),
                    enabled: true,
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(control.tick().unwrap(), Tick::Incomplete);
    }

    #[test]
    fn dangling_device_reference_reports_failure() {
        let db = test_db();
        let control = control(&db);
        control
            .rules
            .update_config(
                &control.control_id,
                RuleUpdate {
                    sensor_id: "s1".into(),
                    device_id: "gone".into(),
                    metric: "temperature_C".into(),
                    operator: Some("<".into()),
                    target_value: 50.0,
                    enabled: true,
                },
            )
            .unwrap();
        record(&control, 20.0);
        assert_eq!(
            control.tick().unwrap(),
            Tick::Actuated {
                value: 20.0,
                on: true,
                success: false
            }
        );
    }

    #[test]
    fn loop_acts_then_stops_on_shutdown() {
        let db = test_db();
        let control = control(&db);
        enable(&control, true);
        record(&control, 26.0);

        let registry = control.registry.clone();
        let mut handle = ShutdownHandle::new();
        handle
            .spawn("control-test".into(), move |token| {
                control.run_loop(
                    LoopTimings {
                        interval: Duration::from_secs(3600),
                        backoff: Duration::from_secs(3600),
                    },
                    &token,
                )
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while virtual_switch(&registry, "d1").state().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(virtual_switch(&registry, "d1").state(), Some(true));

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn loop_survives_failing_ticks() {
        use diesel::connection::SimpleConnection;

        let db = test_db();
        let control = control(&db);
        record(&control, 26.0);
        db.pool
            .get()
            .unwrap()
            .batch_execute("DROP TABLE control_configs")
            .unwrap();
        assert!(control.tick().is_err());

        let registry = control.registry.clone();
        let rules = control.rules.clone();
        let mut handle = ShutdownHandle::new();
        handle
            .spawn("control-broken-store".into(), move |token| {
                control.run_loop(
                    LoopTimings {
                        interval: Duration::from_millis(10),
                        backoff: Duration::from_millis(10),
                    },
                    &token,
                )
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(virtual_switch(&registry, "d1").state(), None);

        db.pool
            .get()
            .unwrap()
            .batch_execute(include_str!("../../migrations/2025-06-01-000000_create_tables/up.sql"))
            .unwrap();
        rules
            .update_config(
                "fan_control",
                RuleUpdate {
                    sensor_id: "s1".into(),
                    device_id: "d1".into(),
                    metric: "temperature_C".into(),
                    operator: Some(">".into()),
                    target_value: 25.0,
                    enabled: true,
                },
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while virtual_switch(&registry, "d1").state().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(virtual_switch(&registry, "d1").state(), Some(true));
        handle.shutdown();
    }

    #[test]
    fn manual_override_is_transient() {
        let db = test_db();
        let control = control(&db);
        enable(&control, true);
        record(&control, 20.0);

        assert!(manual_control(&control.registry, "d1", "on"));
        assert_eq!(virtual_switch(&control.registry, "d1").state(), Some(true));
        assert_eq!(control.rule().unwrap().target_value, 25.0);

        control.tick().unwrap();
        assert_eq!(virtual_switch(&control.registry, "d1").state(), Some(false));
        assert!(!manual_control(&control.registry, "ghost", "off"));
    }
}
