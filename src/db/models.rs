//! Diesel model structs for readings, control rules and the device log.
//!
//! Timestamps are stored as naive UTC ISO-8601 text (see
//! [`crate::utils::format_timestamp`]) so that ordering by the text column
//! is chronological.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

pub mod device_state {
    pub const ON: &str = "on";
    pub const OFF: &str = "off";

    pub fn from_bool(on: bool) -> &'static str {
        if on { ON } else { OFF }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
#[diesel(primary_key(device_id, ts, metric))]
pub struct Reading {
    pub device_id: String,
    pub ts: String,
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
pub struct NewReading<'a> {
    pub device_id: &'a str,
    pub ts: &'a str,
    pub metric: &'a str,
    pub value: f64,
}

/// One automation rule, keyed by the control widget that owns it.
///
/// `operator` is kept as raw text; see [`crate::services::control::evaluate`]
/// for how unrecognised operators are treated.
#[derive(
    Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = schema::control_configs)]
#[diesel(primary_key(control_id))]
pub struct ControlRule {
    pub control_id: String,
    pub sensor_id: String,
    pub device_id: String,
    pub metric: String,
    pub operator: String,
    pub target_value: f64,
    pub enabled: bool,
}

impl ControlRule {
    /// A rule can only be evaluated once it points at a sensor metric and a device.
    pub fn is_complete(&self) -> bool {
        !self.sensor_id.is_empty() && !self.device_id.is_empty() && !self.metric.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_logs)]
pub struct DeviceLogEntry {
    #[serde(skip)]
    pub id: i32,
    pub ts: String,
    pub device_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::device_logs)]
pub struct NewDeviceLogEntry<'a> {
    pub ts: &'a str,
    pub device_id: &'a str,
    pub state: &'a str,
}
