//! Persisted automation rules, one row per control widget.
//!
//! Rows are created lazily from the control's static defaults the first time
//! anyone asks for them, and afterwards only change through
//! [`RuleStore::update_config`].

use crate::config::ControlDefaults;
use crate::db::models::ControlRule;
use crate::db::pool::{Pool, StorageError};
use crate::schema;
use core::fmt;
use diesel::prelude::*;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Read;

pub const DEFAULT_OPERATOR: &str = ">";

/// A rule payload that could not be understood.
#[derive(Debug)]
pub enum ConfigError {
    /// The payload parsed as JSON but a field has the wrong type.
    InvalidField { path: String, message: String },
    /// The payload is not JSON at all, or is truncated.
    Malformed(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidField { path, message } => write!(f, "invalid field `{}`: {}", path, message),
            ConfigError::Malformed(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

impl Error for ConfigError {}

/// Body of a config update. Every field is optional on the wire; a missing
/// field resets the stored value to its default, it does not keep the old one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    pub sensor_id: String,
    pub device_id: String,
    pub metric: String,
    pub operator: Option<String>,
    pub target_value: f64,
    pub enabled: bool,
}

impl RuleUpdate {
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let mut de = serde_json::Deserializer::from_reader(reader);
        serde_path_to_error::deserialize(&mut de).map_err(|e| {
            let path = e.path().to_string();
            let inner = e.into_inner();
            if inner.is_data() {
                ConfigError::InvalidField {
                    path,
                    message: inner.to_string(),
                }
            } else {
                ConfigError::Malformed(inner.to_string())
            }
        })
    }

    fn into_rule(self, control_id: &str) -> ControlRule {
        ControlRule {
            control_id: control_id.to_string(),
            sensor_id: self.sensor_id,
            device_id: self.device_id,
            metric: self.metric,
            operator: self.operator.unwrap_or_else(|| DEFAULT_OPERATOR.to_string()),
            target_value: self.target_value,
            enabled: self.enabled,
        }
    }
}

#[derive(Clone)]
pub struct RuleStore {
    pool: Pool,
}

impl RuleStore {
    pub fn new(pool: Pool) -> Self {
        RuleStore { pool }
    }

    /// Fetch the rule for `control_id`, seeding it from `defaults` if no row exists yet.
    ///
    /// Safe under concurrent first access: the seed insert is ignored when
    /// another caller got there first, and everyone reads back the same row.
    pub fn get_config(&self, control_id: &str, defaults: &ControlDefaults) -> Result<ControlRule, StorageError> {
        use schema::control_configs::dsl as C;

        let mut conn = self.pool.get()?;
        if let Some(rule) = C::control_configs
            .find(control_id)
            .select(ControlRule::as_select())
            .first(&mut conn)
            .optional()?
        {
            return Ok(rule);
        }

        let seed = ControlRule {
            control_id: control_id.to_string(),
            sensor_id: defaults.sensor_id.clone(),
            device_id: defaults.device_id.clone(),
            metric: defaults.metric.clone(),
            operator: defaults.operator.clone(),
            target_value: defaults.target_value,
            enabled: defaults.enabled,
        };
        diesel::insert_or_ignore_into(C::control_configs)
            .values(&seed)
            .execute(&mut conn)?;

        let rule = C::control_configs
            .find(control_id)
            .select(ControlRule::as_select())
            .first(&mut conn)?;
        Ok(rule)
    }

    /// Replace every field of the rule and return the stored row.
    pub fn update_config(&self, control_id: &str, update: RuleUpdate) -> Result<ControlRule, StorageError> {
        use schema::control_configs::dsl as C;

        let rule = update.into_rule(control_id);
        let mut conn = self.pool.get()?;
        conn.immediate_transaction(|conn| {
            diesel::insert_into(C::control_configs)
                .values(&rule)
                .on_conflict(C::control_id)
                .do_update()
                .set(&rule)
                .execute(conn)?;
            C::control_configs
                .find(control_id)
                .select(ControlRule::as_select())
                .first(conn)
        })
        .map_err(StorageError::from)
    }
}
