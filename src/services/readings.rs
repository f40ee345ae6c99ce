use crate::db::models::{NewReading, Reading};
use crate::db::pool::{Pool, StorageError};
use crate::schema;
use diesel::prelude::*;

/// Time-series sensor readings keyed by (device, timestamp, metric).
#[derive(Clone)]
pub struct ReadingStore {
    pool: Pool,
}

impl ReadingStore {
    pub fn new(pool: Pool) -> Self {
        ReadingStore { pool }
    }

    /// Store one value; an existing row for the same key is replaced.
    pub fn insert(&self, device_id: &str, ts: &str, metric: &str, value: f64) -> Result<(), StorageError> {
        use schema::readings::dsl as R;

        let mut conn = self.pool.get()?;
        diesel::replace_into(R::readings)
            .values(&NewReading {
                device_id,
                ts,
                metric,
                value,
            })
            .execute(&mut conn)?;
        Ok(())
    }

    /// Most recent `(timestamp, value)` for a sensor metric.
    pub fn latest(&self, device_id: &str, metric: &str) -> Result<Option<(String, f64)>, StorageError> {
        use schema::readings::dsl as R;

        let mut conn = self.pool.get()?;
        let row = R::readings
            .filter(R::device_id.eq(device_id).and(R::metric.eq(metric)))
            .order(R::ts.desc())
            .select((R::ts, R::value))
            .first::<(String, f64)>(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// Every reading of a device at or after `since`, oldest first.
    pub fn history(&self, device_id: &str, since: &str) -> Result<Vec<Reading>, StorageError> {
        use schema::readings::dsl as R;

        let mut conn = self.pool.get()?;
        let rows = R::readings
            .filter(R::device_id.eq(device_id).and(R::ts.ge(since)))
            .order((R::ts.asc(), R::metric.asc()))
            .select(Reading::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }
}
