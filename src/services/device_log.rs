use crate::db::models::{DeviceLogEntry, NewDeviceLogEntry, device_state};
use crate::db::pool::{Pool, StorageError};
use crate::schema;
use diesel::prelude::*;
use serde::Serialize;

/// Append-only audit trail of successful actuations.
#[derive(Clone)]
pub struct DeviceLog {
    pool: Pool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub current: Option<DeviceLogEntry>,
    pub history: Vec<DeviceLogEntry>,
}

impl DeviceLog {
    pub fn new(pool: Pool) -> Self {
        DeviceLog { pool }
    }

    pub fn append(&self, ts: &str, device_id: &str, on: bool) -> Result<(), StorageError> {
        use schema::device_logs::dsl as L;

        let mut conn = self.pool.get()?;
        diesel::insert_into(L::device_logs)
            .values(&NewDeviceLogEntry {
                ts,
                device_id,
                state: device_state::from_bool(on),
            })
            .execute(&mut conn)?;
        Ok(())
    }

    /// Latest known state plus every change at or after `since`, oldest first.
    pub fn status(&self, device_id: &str, since: &str) -> Result<DeviceStatus, StorageError> {
        use schema::device_logs::dsl as L;

        let mut conn = self.pool.get()?;
        let current = L::device_logs
            .filter(L::device_id.eq(device_id))
            .order((L::ts.desc(), L::id.desc()))
            .select(DeviceLogEntry::as_select())
            .first(&mut conn)
            .optional()?;
        let history = L::device_logs
            .filter(L::device_id.eq(device_id).and(L::ts.ge(since)))
            .order((L::ts.asc(), L::id.asc()))
            .select(DeviceLogEntry::as_select())
            .load(&mut conn)?;
        Ok(DeviceStatus { current, history })
    }

    #[cfg(test)]
    pub fn entries(&self, device_id: &str) -> Result<Vec<DeviceLogEntry>, StorageError> {
        self.status(device_id, "").map(|s| s.history)
    }
}
