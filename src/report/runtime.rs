//! Runtime hours from thresholded sample counts.
//!
//! Each sample above the threshold stands for one polling interval of
//! running time. Missed polls therefore undercount; the estimate is only as
//! good as the poll cadence is regular.

use super::{round2, TimeWindow};
use crate::db::{DbError, TimeSeriesStore};

use std::time::Duration;

/// Convert a running-sample count into hours, clamped to the window length.
pub fn runtime_hours(count: u64, poll_interval: Duration, window: &TimeWindow) -> f64 {
    let hours = count as f64 * poll_interval.as_secs_f64() / 3600.0;
    round2(hours).clamp(0.0, window.hours())
}

/// Hours `field` spent strictly above `threshold` inside `window`.
pub fn estimate_runtime<S: TimeSeriesStore + ?Sized>(
    store: &S,
    device_id: &str,
    field: &str,
    threshold: f64,
    window: &TimeWindow,
    poll_interval: Duration,
) -> Result<f64, DbError> {
    let count = store.count_above_threshold(device_id, field, threshold, window)?;
    Ok(runtime_hours(count, poll_interval, window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SampleFilter, SensorReading, Store, TimeSeriesStore, WriteBatch};
    use crate::layout::{DeviceType, POWER};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn day() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2026, 1, 19, 0, 0, 0).unwrap();
        TimeWindow::new(start, start + ChronoDuration::days(1)).unwrap()
    }

    #[test]
    fn test_six_hundred_samples_is_one_hour() {
        assert_eq!(runtime_hours(600, Duration::from_secs(6), &day()), 1.0);
    }

    #[test]
    fn test_zero_samples() {
        assert_eq!(runtime_hours(0, Duration::from_secs(6), &day()), 0.0);
    }

    #[test]
    fn test_monotonic_in_count() {
        let window = day();
        let mut last = 0.0;
        for count in (0..20_000).step_by(137) {
            let hours = runtime_hours(count, Duration::from_secs(6), &window);
            assert!(hours >= last);
            last = hours;
        }
    }

    #[test]
    fn test_clamped_to_window() {
        let start = Utc.with_ymd_and_hms(2026, 1, 19, 0, 0, 0).unwrap();
        let hour = TimeWindow::new(start, start + ChronoDuration::hours(1)).unwrap();
        // 1200 samples at 6 s would be two hours
        assert_eq!(runtime_hours(1200, Duration::from_secs(6), &hour), 1.0);
    }

    fn power_reading(t: DateTime<Utc>, power: f64) -> SensorReading {
        SensorReading {
            device_id: "zone1".to_string(),
            timestamp: t,
            device_type: DeviceType::KilnZone,
            module_tag: "zone1_meter".to_string(),
            fields: BTreeMap::from([(POWER.to_string(), power)]),
        }
    }

    #[test]
    fn test_estimate_from_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path(), Duration::from_secs(1)).unwrap();
        let window = day();

        // 900 running samples and 300 idle ones
        let readings: Vec<_> = (0..1200)
            .map(|i| {
                let power = if i % 4 == 0 { 0.0 } else { 12.5 };
                power_reading(window.start + ChronoDuration::seconds(6 * i), power)
            })
            .collect();
        store.write_batch(&WriteBatch::from(readings)).unwrap();

        let poll = Duration::from_secs(6);
        let hours = estimate_runtime(&store, "zone1", POWER, 0.01, &window, poll).unwrap();
        assert_eq!(hours, 1.5);

        let missing = estimate_runtime(&store, "zone2", POWER, 0.01, &window, poll).unwrap();
        assert_eq!(missing, 0.0);

        let idle = store
            .query_range("zone1", POWER, &window, SampleFilter::All)
            .unwrap()
            .iter()
            .filter(|s| s.value <= 0.01)
            .count();
        assert_eq!(idle, 300);
    }
}
