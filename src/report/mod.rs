//! Per-day consumption, feeding and runtime reports.

mod aggregate;
mod consumption;
mod history;
mod runtime;
mod window;

pub use aggregate::*;
pub use consumption::*;
pub use history::*;
pub use runtime::*;
pub use window::*;

use crate::layout::DeviceType;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// One device, one calendar day. Facets that do not apply to the device's
/// category are `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    #[serde(rename = "start_time")]
    pub window_start: DateTime<Utc>,
    #[serde(rename = "end_time")]
    pub window_end: DateTime<Utc>,
    pub gas_consumption: f64,
    pub feeding_amount: f64,
    pub electricity_consumption: f64,
    pub runtime_hours: f64,
}

impl DailyRecord {
    pub fn zeroed(day: &DayWindow) -> Self {
        Self {
            date: day.date,
            window_start: day.window.start,
            window_end: day.window.end,
            gas_consumption: 0.0,
            feeding_amount: 0.0,
            electricity_consumption: 0.0,
            runtime_hours: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeDeviceReport {
    pub device_id: String,
    pub device_type: DeviceType,
    pub daily_records: Vec<DailyRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
