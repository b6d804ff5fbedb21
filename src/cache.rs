//! Per-(location, date) schedule cache on top of the key-value store

use std::sync::Arc;
use tracing::debug;

use crate::error::ScheduleError;
use crate::model::ScheduleRecord;
use crate::store::KeyValueStore;
use crate::time::CalendarDate;

/// Key namespace; bump the version when the stored record shape changes
const CACHE_PREFIX: &str = "imsakiyah_v3";

pub fn cache_key(location_id: &str, date: CalendarDate) -> String {
    format!("{}_{}_{}", CACHE_PREFIX, location_id, date)
}

#[derive(Clone)]
pub struct ScheduleCache {
    store: Arc<dyn KeyValueStore>,
}

impl ScheduleCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached record, or `None` on a miss. Corrupt entries count as misses.
    pub fn get(&self, location_id: &str, date: CalendarDate) -> Option<ScheduleRecord> {
        let key = cache_key(location_id, date);
        let raw = self.store.get(&key)?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(source) => {
                debug!("{}", ScheduleError::CacheCorrupt { key, source });
                None
            }
        }
    }

    pub fn put(&self, location_id: &str, date: CalendarDate, record: &ScheduleRecord) {
        match serde_json::to_string(record) {
            Ok(json) => self.store.set(&cache_key(location_id, date), &json),
            Err(e) => debug!("Not caching {} for {}: {}", date, location_id, e),
        }
    }
}
