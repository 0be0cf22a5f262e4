//! Composite report across device categories.
//!
//! Every measured device is computed on its own blocking task. Facet failures
//! stay inside the device that hit them: the facet reads `0.0` and the report
//! carries a warning. Kiln aggregates are derived afterwards from the zone
//! reports.

use super::{
    consumption, estimate_runtime, round2, split_by_day, CompositeDeviceReport, CounterResetPolicy,
    DailyRecord, DayWindow, TimeWindow,
};
use crate::db::{DbError, TimeSeriesStore};
use crate::layout::{
    DeviceDescriptor, DeviceType, FacetSet, LayoutHandle, RuntimeSignal, Thresholds, ENERGY,
    FLOW_RATE, GAS_TOTAL, POWER,
};

use chrono::{FixedOffset, Offset, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Report parameters taken from the server configuration.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    /// Nominal poll cadence each running sample stands for.
    pub poll_interval: Duration,
    pub utc_offset: FixedOffset,
    pub counter_reset: CounterResetPolicy,
    /// Budget for one report's store queries. Facets unfinished by then read
    /// `0.0` with a warning.
    pub query_timeout: Duration,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(6),
            utc_offset: Utc.fix(),
            counter_reset: CounterResetPolicy::SurfaceRaw,
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds composite reports from a store and the active layout.
pub struct Aggregator<S> {
    store: Arc<S>,
    layout: LayoutHandle,
    settings: ReportSettings,
}

impl<S: TimeSeriesStore> Aggregator<S> {
    pub fn new(store: Arc<S>, layout: LayoutHandle, settings: ReportSettings) -> Self {
        Self {
            store,
            layout,
            settings,
        }
    }

    pub fn settings(&self) -> &ReportSettings {
        &self.settings
    }

    /// Reports for every device in `categories` (all categories when empty),
    /// one record per local calendar day touched by `range`.
    ///
    /// Output is ordered by category, then device id; records by date.
    pub async fn build_report(
        &self,
        categories: &[DeviceType],
        range: TimeWindow,
    ) -> Vec<CompositeDeviceReport> {
        let table = self.layout.current();
        let days = split_by_day(range.start, range.end, self.settings.utc_offset);
        let wanted = |t: DeviceType| categories.is_empty() || categories.contains(&t);

        let selected: Vec<&DeviceDescriptor> =
            table.devices().filter(|d| wanted(d.device_type)).collect();

        // Measured devices to compute: the selected ones plus any zone an
        // aggregate needs.
        let mut measured: BTreeSet<&str> = BTreeSet::new();
        for device in &selected {
            if device.is_derived() {
                measured.extend(device.constituents.iter().map(String::as_str));
            } else {
                measured.insert(&device.device_id);
            }
        }

        let thresholds = table.thresholds();
        let timeout = self.settings.query_timeout;
        let deadline = Instant::now() + timeout;
        let mut pending = Vec::with_capacity(measured.len());
        for id in measured {
            let Some(device) = table.device(id) else {
                continue;
            };
            let progress = Arc::new(Mutex::new(DeviceProgress::new(device, &days)));
            let store = self.store.clone();
            let task_device = device.clone();
            let task_days = days.clone();
            let task_progress = progress.clone();
            let settings = self.settings.clone();
            let handle = tokio::task::spawn_blocking(move || {
                device_report(
                    &*store,
                    &task_device,
                    &task_days,
                    thresholds,
                    &settings,
                    deadline,
                    &task_progress,
                )
            });
            pending.push((
                device,
                progress,
                tokio::time::timeout_at(deadline.into(), handle),
            ));
        }

        let mut computed: BTreeMap<String, CompositeDeviceReport> = BTreeMap::new();
        for (device, progress, task) in pending {
            let report = match task.await {
                Ok(Ok(())) => progress.lock().unwrap().report(timeout),
                Ok(Err(e)) => {
                    tracing::error!("Report task for {} failed: {}", device.device_id, e);
                    zeroed_report(device, &days, format!("report task failed: {}", e))
                }
                Err(_) => {
                    let report = progress.lock().unwrap().report(timeout);
                    tracing::warn!(
                        "Report for {} timed out after {:?} ({} facets unfinished)",
                        device.device_id,
                        timeout,
                        report.warnings.len()
                    );
                    report
                }
            };
            computed.insert(device.device_id.clone(), report);
        }

        let mut reports: Vec<CompositeDeviceReport> = selected
            .iter()
            .filter_map(|device| {
                if device.is_derived() {
                    Some(derive_aggregate(device, &computed, &days))
                } else {
                    computed.get(&device.device_id).cloned()
                }
            })
            .collect();

        sort_reports(&mut reports);
        reports
    }
}

const FEEDING: &str = "feeding_amount";
const ELECTRICITY: &str = "electricity_consumption";
const GAS: &str = "gas_consumption";
const RUNTIME: &str = "runtime_hours";

/// Facets computed from the store for a category, in report order.
fn facet_names(facets: FacetSet) -> Vec<&'static str> {
    let mut names = Vec::new();
    if facets.feeding {
        names.push(FEEDING);
    }
    if facets.electricity {
        names.push(ELECTRICITY);
    }
    if facets.gas {
        names.push(GAS);
    }
    if facets.runtime != RuntimeSignal::ZoneMean {
        names.push(RUNTIME);
    }
    names
}

/// Facet results of one measured device, filled in as its queries complete.
#[derive(Debug, Clone)]
pub struct DeviceProgress {
    report: CompositeDeviceReport,
    /// (day index, facet) pairs not computed yet.
    pending: BTreeSet<(usize, &'static str)>,
}

impl DeviceProgress {
    pub fn new(device: &DeviceDescriptor, days: &[DayWindow]) -> Self {
        let names = facet_names(device.device_type.facets());
        let pending = (0..days.len())
            .flat_map(|i| names.iter().map(move |name| (i, *name)))
            .collect();
        Self {
            report: CompositeDeviceReport {
                device_id: device.device_id.clone(),
                device_type: device.device_type,
                daily_records: days.iter().map(DailyRecord::zeroed).collect(),
                warnings: Vec::new(),
            },
            pending,
        }
    }

    /// Store one facet result. A failed query leaves the facet at `0.0`.
    fn record(&mut self, day: usize, facet: &'static str, result: Result<f64, DbError>) {
        self.pending.remove(&(day, facet));
        let Some(record) = self.report.daily_records.get_mut(day) else {
            return;
        };
        let value = match result {
            Ok(value) => round2(value),
            Err(e) => {
                tracing::warn!(
                    "{} {} on {}: {}",
                    self.report.device_id,
                    facet,
                    record.date,
                    e
                );
                self.report
                    .warnings
                    .push(format!("{} on {}: {}", facet, record.date, e));
                return;
            }
        };
        match facet {
            FEEDING => record.feeding_amount = value,
            ELECTRICITY => record.electricity_consumption = value,
            GAS => record.gas_consumption = value,
            _ => record.runtime_hours = value,
        }
    }

    /// The report as it stands. Facets still pending read `0.0` and get a
    /// timeout warning.
    pub fn report(&self, timeout: Duration) -> CompositeDeviceReport {
        let mut report = self.report.clone();
        for (day, facet) in &self.pending {
            if let Some(record) = report.daily_records.get(*day) {
                report.warnings.push(format!(
                    "{} on {}: store query timed out after {:?}",
                    facet, record.date, timeout
                ));
            }
        }
        report
    }
}

/// Compute every applicable facet of one measured device for each day into
/// `progress`. Stops issuing queries once `deadline` has passed.
pub fn device_report<S: TimeSeriesStore + ?Sized>(
    store: &S,
    device: &DeviceDescriptor,
    days: &[DayWindow],
    thresholds: Thresholds,
    settings: &ReportSettings,
    deadline: Instant,
    progress: &Mutex<DeviceProgress>,
) {
    let names = facet_names(device.device_type.facets());
    for (i, day) in days.iter().enumerate() {
        for &facet in &names {
            if Instant::now() >= deadline {
                return;
            }
            let result = query_facet(store, device, facet, &day.window, thresholds, settings);
            progress.lock().unwrap().record(i, facet, result);
        }
    }
}

fn query_facet<S: TimeSeriesStore + ?Sized>(
    store: &S,
    device: &DeviceDescriptor,
    facet: &str,
    window: &TimeWindow,
    thresholds: Thresholds,
    settings: &ReportSettings,
) -> Result<f64, DbError> {
    let id = &device.device_id;
    match facet {
        FEEDING => store.sum_feeding(id, window),
        ELECTRICITY => {
            consumption(store, id, ENERGY, window, settings.counter_reset).map(|d| d.consumption)
        }
        GAS => consumption(store, id, GAS_TOTAL, window, settings.counter_reset)
            .map(|d| d.consumption),
        _ => {
            let (field, threshold) = match device.device_type.facets().runtime {
                RuntimeSignal::Flow => (FLOW_RATE, thresholds.flow_threshold),
                _ => (POWER, thresholds.power_threshold),
            };
            estimate_runtime(store, id, field, threshold, window, settings.poll_interval)
        }
    }
}

/// Electricity and runtime of an aggregate: the mean of its zones' values
/// for the same day. Zones without a report are left out of the mean.
pub fn derive_aggregate(
    aggregate: &DeviceDescriptor,
    zones: &BTreeMap<String, CompositeDeviceReport>,
    days: &[DayWindow],
) -> CompositeDeviceReport {
    let mut warnings = Vec::new();
    let mut members = Vec::new();
    for id in &aggregate.constituents {
        match zones.get(id) {
            Some(report) => {
                if !report.warnings.is_empty() {
                    warnings.push(format!("{}: {}", id, report.warnings.join("; ")));
                }
                members.push(report);
            }
            None => warnings.push(format!("constituent {} has no data", id)),
        }
    }

    let daily_records = days
        .iter()
        .map(|day| {
            let mut record = DailyRecord::zeroed(day);
            let same_day: Vec<&DailyRecord> = members
                .iter()
                .filter_map(|r| r.daily_records.iter().find(|d| d.date == day.date))
                .collect();
            if !same_day.is_empty() {
                let n = same_day.len() as f64;
                record.electricity_consumption = round2(
                    same_day.iter().map(|d| d.electricity_consumption).sum::<f64>() / n,
                );
                record.runtime_hours =
                    round2(same_day.iter().map(|d| d.runtime_hours).sum::<f64>() / n);
            }
            record
        })
        .collect();

    CompositeDeviceReport {
        device_id: aggregate.device_id.clone(),
        device_type: aggregate.device_type,
        daily_records,
        warnings,
    }
}

fn zeroed_report(
    device: &DeviceDescriptor,
    days: &[DayWindow],
    warning: String,
) -> CompositeDeviceReport {
    CompositeDeviceReport {
        device_id: device.device_id.clone(),
        device_type: device.device_type,
        daily_records: days.iter().map(DailyRecord::zeroed).collect(),
        warnings: vec![warning],
    }
}

/// Category order first, then device id.
pub fn sort_reports(reports: &mut [CompositeDeviceReport]) {
    reports.sort_by(|a, b| {
        a.device_type
            .cmp(&b.device_type)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FeedingRecord, Sample, SampleFilter, SensorReading, Store, WriteBatch};
    use crate::layout::{LayoutTable, PlantConfig};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 19, 0, 0, 0).unwrap()
    }

    fn two_days() -> TimeWindow {
        TimeWindow::new(t0(), t0() + ChronoDuration::days(2)).unwrap()
    }

    fn reading(
        device_id: &str,
        device_type: DeviceType,
        t: DateTime<Utc>,
        fields: &[(&str, f64)],
    ) -> SensorReading {
        SensorReading {
            device_id: device_id.to_string(),
            timestamp: t,
            device_type,
            module_tag: "meter".to_string(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    /// One running sample per 6 s for `samples` polls, energy rising by `step`.
    fn meter_series(
        device_id: &str,
        device_type: DeviceType,
        start: DateTime<Utc>,
        samples: i64,
        step: f64,
    ) -> Vec<SensorReading> {
        (0..samples)
            .map(|i| {
                reading(
                    device_id,
                    device_type,
                    start + ChronoDuration::seconds(6 * i),
                    &[(POWER, 15.0), (ENERGY, 1000.0 + step * i as f64)],
                )
            })
            .collect()
    }

    fn aggregator(store: Arc<Store>) -> Aggregator<Store> {
        let layout = LayoutHandle::new(LayoutTable::build(PlantConfig::workshop()).unwrap());
        Aggregator::new(store, layout, ReportSettings::default())
    }

    fn open_store() -> (NamedTempFile, Arc<Store>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path(), std::time::Duration::from_secs(1)).unwrap());
        (tmp, store)
    }

    #[tokio::test]
    async fn test_report_facets_by_category() {
        let (_tmp, store) = open_store();

        // fan_1: 600 running polls on day one, energy +0.5 per poll
        store
            .write_batch(&WriteBatch::from(meter_series("fan_1", DeviceType::Fan, t0(), 600, 0.5)))
            .unwrap();
        // scr_1: gas flowing for 300 polls on day two
        let day2 = t0() + ChronoDuration::days(1);
        let gas: Vec<_> = (0..300)
            .map(|i| {
                reading(
                    "scr_1",
                    DeviceType::GasMeter,
                    day2 + ChronoDuration::seconds(6 * i),
                    &[(FLOW_RATE, 3.2), (GAS_TOTAL, 50.0 + 0.1 * i as f64)],
                )
            })
            .collect();
        store.write_batch(&WriteBatch::from(gas)).unwrap();
        let feeding = WriteBatch {
            feedings: vec![FeedingRecord {
                time: t0() + ChronoDuration::hours(3),
                device_id: "short_hopper_1".to_string(),
                added_weight: 250.0,
            }],
            ..Default::default()
        };
        store.write_batch(&feeding).unwrap();

        let reports = aggregator(store).build_report(&[], two_days()).await;
        assert_eq!(reports.len(), 22);

        let fan = reports.iter().find(|r| r.device_id == "fan_1").unwrap();
        assert_eq!(fan.daily_records.len(), 2);
        assert_eq!(fan.daily_records[0].runtime_hours, 1.0);
        assert_eq!(fan.daily_records[0].electricity_consumption, 299.5);
        assert_eq!(fan.daily_records[1].runtime_hours, 0.0);

        let scr = reports.iter().find(|r| r.device_id == "scr_1").unwrap();
        assert_eq!(scr.daily_records[1].gas_consumption, 29.9);
        assert_eq!(scr.daily_records[1].runtime_hours, 0.5);
        for record in &scr.daily_records {
            assert_eq!(record.electricity_consumption, 0.0);
        }

        let hopper = reports.iter().find(|r| r.device_id == "short_hopper_1").unwrap();
        assert_eq!(hopper.daily_records[0].feeding_amount, 250.0);
        let no_weigh = reports.iter().find(|r| r.device_id == "no_hopper_1").unwrap();
        assert!(no_weigh.daily_records.iter().all(|d| d.feeding_amount == 0.0));
        assert!(reports.iter().all(|r| r.warnings.is_empty()));
    }

    #[tokio::test]
    async fn test_report_ordering() {
        let (_tmp, store) = open_store();
        let reports = aggregator(store).build_report(&[], two_days()).await;

        let order: Vec<(DeviceType, &str)> = reports
            .iter()
            .map(|r| (r.device_type, r.device_id.as_str()))
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(reports[0].device_id, "long_hopper_1");
        assert_eq!(reports.last().unwrap().device_id, "fan_2");
        for report in &reports {
            assert!(report.daily_records.windows(2).all(|w| w[0].date < w[1].date));
        }
    }

    #[tokio::test]
    async fn test_aggregate_is_zone_mean() {
        let (_tmp, store) = open_store();
        // zone1 runs an hour, zone2 half an hour, the rest are idle
        for (zone, polls) in [("zone1", 600), ("zone2", 300)] {
            let series = meter_series(zone, DeviceType::KilnZone, t0(), polls, 1.0);
            store.write_batch(&WriteBatch::from(series)).unwrap();
        }

        let reports = aggregator(store)
            .build_report(&[DeviceType::KilnZoneAggregate], two_days())
            .await;

        assert_eq!(reports.len(), 1);
        let total = &reports[0];
        assert_eq!(total.device_id, "roller_kiln_total");
        // (1.0 + 0.5) / 6 zones
        assert_eq!(total.daily_records[0].runtime_hours, 0.25);
        // (599 + 299) / 6
        assert_eq!(total.daily_records[0].electricity_consumption, 149.67);
        assert_eq!(total.daily_records[1].runtime_hours, 0.0);
    }

    #[tokio::test]
    async fn test_category_filter() {
        let (_tmp, store) = open_store();
        let reports = aggregator(store)
            .build_report(&[DeviceType::GasMeter, DeviceType::Pump], two_days())
            .await;
        let ids: Vec<_> = reports.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["scr_1", "scr_2", "scr_1_pump", "scr_2_pump"]);
    }

    /// Store that fails every query for one device.
    struct FlakyStore {
        inner: Store,
        broken: &'static str,
    }

    impl FlakyStore {
        fn check(&self, device_id: &str) -> Result<(), DbError> {
            if device_id == self.broken {
                return Err(DbError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            Ok(())
        }
    }

    impl TimeSeriesStore for FlakyStore {
        fn write_batch(&self, batch: &WriteBatch) -> Result<usize, DbError> {
            self.inner.write_batch(batch)
        }

        fn query_range(
            &self,
            device_id: &str,
            field: &str,
            window: &TimeWindow,
            filter: SampleFilter,
        ) -> Result<Vec<Sample>, DbError> {
            self.check(device_id)?;
            self.inner.query_range(device_id, field, window, filter)
        }

        fn count_above_threshold(
            &self,
            device_id: &str,
            field: &str,
            threshold: f64,
            window: &TimeWindow,
        ) -> Result<u64, DbError> {
            self.inner.count_above_threshold(device_id, field, threshold, window)
        }

        fn sum_feeding(&self, device_id: &str, window: &TimeWindow) -> Result<f64, DbError> {
            self.inner.sum_feeding(device_id, window)
        }
    }

    #[tokio::test]
    async fn test_query_failure_is_isolated() {
        let tmp = NamedTempFile::new().unwrap();
        let inner = Store::new(tmp.path(), std::time::Duration::from_secs(1)).unwrap();
        for fan in ["fan_1", "fan_2"] {
            let series = meter_series(fan, DeviceType::Fan, t0(), 600, 0.5);
            inner.write_batch(&WriteBatch::from(series)).unwrap();
        }
        let store = Arc::new(FlakyStore {
            inner,
            broken: "fan_1",
        });

        let layout = LayoutHandle::new(LayoutTable::build(PlantConfig::workshop()).unwrap());
        let reports = Aggregator::new(store, layout, ReportSettings::default())
            .build_report(&[DeviceType::Fan], two_days())
            .await;

        let broken = &reports[0];
        assert_eq!(broken.device_id, "fan_1");
        // electricity failed, runtime still computed
        assert_eq!(broken.daily_records[0].electricity_consumption, 0.0);
        assert_eq!(broken.daily_records[0].runtime_hours, 1.0);
        assert_eq!(broken.warnings.len(), 2);
        assert!(broken.warnings[0].starts_with("electricity_consumption on 2026-01-19"));

        let healthy = &reports[1];
        assert_eq!(healthy.daily_records[0].electricity_consumption, 299.5);
        assert!(healthy.warnings.is_empty());
    }

    /// Store whose runtime count stalls for windows starting at `slow_from`.
    struct StallingStore {
        inner: Store,
        slow_from: DateTime<Utc>,
        stall: std::time::Duration,
    }

    impl TimeSeriesStore for StallingStore {
        fn write_batch(&self, batch: &WriteBatch) -> Result<usize, DbError> {
            self.inner.write_batch(batch)
        }

        fn query_range(
            &self,
            device_id: &str,
            field: &str,
            window: &TimeWindow,
            filter: SampleFilter,
        ) -> Result<Vec<Sample>, DbError> {
            self.inner.query_range(device_id, field, window, filter)
        }

        fn count_above_threshold(
            &self,
            device_id: &str,
            field: &str,
            threshold: f64,
            window: &TimeWindow,
        ) -> Result<u64, DbError> {
            if window.start == self.slow_from {
                std::thread::sleep(self.stall);
            }
            self.inner.count_above_threshold(device_id, field, threshold, window)
        }

        fn sum_feeding(&self, device_id: &str, window: &TimeWindow) -> Result<f64, DbError> {
            self.inner.sum_feeding(device_id, window)
        }
    }

    #[tokio::test]
    async fn test_timeout_keeps_completed_facets() {
        let tmp = NamedTempFile::new().unwrap();
        let inner = Store::new(tmp.path(), std::time::Duration::from_secs(1)).unwrap();
        let series = meter_series("fan_1", DeviceType::Fan, t0(), 600, 0.5);
        inner.write_batch(&WriteBatch::from(series)).unwrap();
        let store = Arc::new(StallingStore {
            inner,
            slow_from: t0() + ChronoDuration::days(1),
            stall: std::time::Duration::from_millis(800),
        });

        let layout = LayoutHandle::new(LayoutTable::build(PlantConfig::workshop()).unwrap());
        let settings = ReportSettings {
            query_timeout: std::time::Duration::from_millis(300),
            ..ReportSettings::default()
        };
        let reports = Aggregator::new(store, layout, settings)
            .build_report(&[DeviceType::Fan], two_days())
            .await;

        let fan = &reports[0];
        assert_eq!(fan.device_id, "fan_1");
        assert_eq!(fan.daily_records[0].electricity_consumption, 299.5);
        assert_eq!(fan.daily_records[0].runtime_hours, 1.0);
        assert_eq!(fan.daily_records[1].runtime_hours, 0.0);
        assert_eq!(fan.warnings.len(), 1);
        assert!(fan.warnings[0].starts_with("runtime_hours on 2026-01-20: store query timed out"));
    }

    #[test]
    fn test_derive_aggregate_with_missing_zone() {
        let table = LayoutTable::build(PlantConfig::workshop()).unwrap();
        let aggregate = table.device("roller_kiln_total").unwrap();
        let offset = ReportSettings::default().utc_offset;
        let days = split_by_day(t0(), t0() + ChronoDuration::days(1), offset);

        let mut zones = BTreeMap::new();
        let mut zone1 = zeroed_report(table.device("zone1").unwrap(), &days, String::new());
        zone1.warnings.clear();
        zone1.daily_records[0].runtime_hours = 3.0;
        zones.insert("zone1".to_string(), zone1);

        let derived = derive_aggregate(aggregate, &zones, &days);
        assert_eq!(derived.daily_records[0].runtime_hours, 3.0);
        assert_eq!(derived.warnings.len(), 5);
        assert_eq!(derived.daily_records[0].feeding_amount, 0.0);
    }
}
