//! Database model types.

use crate::layout::{AlarmLevel, DeviceType};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One decoded module of one device at one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_type: DeviceType,
    /// Logical sub-module the fields came from (meter, weigh, gas_meter...).
    pub module_tag: String,
    pub fields: BTreeMap<String, f64>,
}

/// A single stored value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// A hopper refill detected from the weight signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedingRecord {
    pub time: DateTime<Utc>,
    pub device_id: String,
    /// kg
    pub added_weight: f64,
}

/// A field that crossed one of its alarm limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub device_type: DeviceType,
    pub field: String,
    pub level: AlarmLevel,
    pub value: f64,
    /// The limit that was exceeded.
    pub threshold: f64,
}

/// Everything one flush writes. Committed in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub readings: Vec<SensorReading>,
    pub feedings: Vec<FeedingRecord>,
    pub alarms: Vec<AlarmEvent>,
}

impl WriteBatch {
    pub fn point_count(&self) -> usize {
        self.readings.iter().map(|r| r.fields.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty() && self.feedings.is_empty() && self.alarms.is_empty()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
        self.feedings.clear();
        self.alarms.clear();
    }
}

impl From<Vec<SensorReading>> for WriteBatch {
    fn from(readings: Vec<SensorReading>) -> Self {
        Self {
            readings,
            ..Default::default()
        }
    }
}

/// Filters for listing alarm events.
#[derive(Debug, Clone)]
pub struct AlarmQuery {
    pub level: Option<AlarmLevel>,
    pub device_id: Option<String>,
    /// Matches fields starting with this prefix.
    pub field_prefix: Option<String>,
    pub limit: usize,
}

impl Default for AlarmQuery {
    fn default() -> Self {
        Self {
            level: None,
            device_id: None,
            field_prefix: None,
            limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlarmCounts {
    pub warning: u64,
    pub alarm: u64,
    pub total: u64,
}

/// Row filter for range queries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SampleFilter {
    #[default]
    All,
    /// Only values strictly above the bound.
    Above(f64),
}

/// Sensor point statistics for the status page.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub point_count: i64,
    pub feeding_count: i64,
    pub alarm_count: i64,
    pub db_size_bytes: i64,
}
