//! Per-device poll health and writer statistics.

use crate::codec::ModuleStatus;
use crate::layout::DeviceType;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Poll cycle state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    #[default]
    Idle,
    Reading,
    Decoded,
    ReadFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub device_type: DeviceType,
    pub state: PollState,
    /// Set by a failed read, cleared by the next decoded one.
    pub stale: bool,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub decode_errors: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub modules: BTreeMap<String, ModuleStatus>,
    pub latest: BTreeMap<String, f64>,
}

impl DeviceHealth {
    fn new(device_id: &str, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type,
            state: PollState::Idle,
            stale: true,
            consecutive_failures: 0,
            total_failures: 0,
            decode_errors: 0,
            last_success: None,
            last_error: None,
            modules: BTreeMap::new(),
            latest: BTreeMap::new(),
        }
    }
}

/// Health of every polled device, shared with the web layer.
#[derive(Default)]
pub struct HealthRegistry {
    devices: RwLock<BTreeMap<String, DeviceHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: &str, device_type: DeviceType) {
        let mut devices = self.devices.write().unwrap();
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id, device_type));
    }

    /// Forget devices that are no longer configured.
    pub fn retain(&self, device_ids: &BTreeSet<String>) {
        let mut devices = self.devices.write().unwrap();
        devices.retain(|id, _| device_ids.contains(id));
    }

    pub fn set_state(&self, device_id: &str, state: PollState) {
        let mut devices = self.devices.write().unwrap();
        if let Some(health) = devices.get_mut(device_id) {
            health.state = state;
        }
    }

    /// Record a decoded read. Module status changes are logged on the way
    /// into error and on recovery only.
    pub fn record_success(
        &self,
        device_id: &str,
        time: DateTime<Utc>,
        fields: &BTreeMap<String, f64>,
        modules: &BTreeMap<String, ModuleStatus>,
        decode_errors: usize,
    ) {
        let mut devices = self.devices.write().unwrap();
        let Some(health) = devices.get_mut(device_id) else {
            return;
        };

        if health.stale && health.consecutive_failures > 0 {
            tracing::info!(
                "{} is back after {} failed reads",
                device_id,
                health.consecutive_failures
            );
        }

        for (name, status) in modules {
            let was_error = health.modules.get(name).map_or(false, |s| s.error);
            if status.error && !was_error {
                tracing::warn!(
                    "{} module {} reports error (status word {:#06x})",
                    device_id,
                    name,
                    status.status_word
                );
            } else if !status.error && was_error {
                tracing::info!("{} module {} recovered", device_id, name);
            }
            health.modules.insert(name.clone(), *status);
        }

        health.state = PollState::Decoded;
        health.stale = false;
        health.consecutive_failures = 0;
        health.decode_errors += decode_errors as u64;
        health.last_success = Some(time);
        health.last_error = None;
        health.latest.extend(fields.iter().map(|(k, v)| (k.clone(), *v)));
    }

    pub fn record_failure(&self, device_id: &str, error: &str) {
        let mut devices = self.devices.write().unwrap();
        if let Some(health) = devices.get_mut(device_id) {
            health.state = PollState::ReadFailed;
            health.stale = true;
            health.consecutive_failures += 1;
            health.total_failures += 1;
            health.last_error = Some(error.to_string());
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceHealth> {
        self.devices.read().unwrap().get(device_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceHealth> {
        self.devices.read().unwrap().values().cloned().collect()
    }
}

/// Batch writer counters.
#[derive(Default)]
pub struct WriterStats {
    points_written: AtomicU64,
    feeding_written: AtomicU64,
    alarms_written: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_points: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterStatsSnapshot {
    pub points_written: u64,
    pub feeding_written: u64,
    pub alarms_written: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub dropped_points: u64,
}

impl WriterStats {
    pub fn record_flush(&self, points: usize, feeding: usize, alarms: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.points_written.fetch_add(points as u64, Ordering::Relaxed);
        self.feeding_written.fetch_add(feeding as u64, Ordering::Relaxed);
        self.alarms_written.fetch_add(alarms as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, points: usize) {
        self.dropped_points.fetch_add(points as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            points_written: self.points_written.load(Ordering::Relaxed),
            feeding_written: self.feeding_written.load(Ordering::Relaxed),
            alarms_written: self.alarms_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dropped_points: self.dropped_points.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(error: bool) -> BTreeMap<String, ModuleStatus> {
        BTreeMap::from([(
            "meter_status".to_string(),
            ModuleStatus {
                error,
                status_word: 0x8001,
            },
        )])
    }

    #[test]
    fn test_failure_then_recovery() {
        let registry = HealthRegistry::new();
        registry.register("fan_1", DeviceType::Fan);
        assert!(registry.get("fan_1").unwrap().stale);

        registry.record_failure("fan_1", "timeout");
        registry.record_failure("fan_1", "timeout");
        let failed = registry.get("fan_1").unwrap();
        assert_eq!(failed.state, PollState::ReadFailed);
        assert_eq!(failed.consecutive_failures, 2);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        let fields = BTreeMap::from([("Pt".to_string(), 12.0)]);
        registry.record_success("fan_1", Utc::now(), &fields, &status(false), 1);
        let ok = registry.get("fan_1").unwrap();
        assert_eq!(ok.state, PollState::Decoded);
        assert!(!ok.stale);
        assert_eq!(ok.consecutive_failures, 0);
        assert_eq!(ok.total_failures, 2);
        assert_eq!(ok.decode_errors, 1);
        assert_eq!(ok.latest["Pt"], 12.0);
    }

    #[test]
    fn test_module_status_tracked() {
        let registry = HealthRegistry::new();
        registry.register("zone1", DeviceType::KilnZone);
        let empty = BTreeMap::new();

        registry.record_success("zone1", Utc::now(), &empty, &status(true), 0);
        assert!(registry.get("zone1").unwrap().modules["meter_status"].error);

        registry.record_success("zone1", Utc::now(), &empty, &status(false), 0);
        assert!(!registry.get("zone1").unwrap().modules["meter_status"].error);
    }

    #[test]
    fn test_unknown_device_ignored_and_retain() {
        let registry = HealthRegistry::new();
        registry.record_failure("ghost", "nope");
        assert!(registry.get("ghost").is_none());

        registry.register("fan_1", DeviceType::Fan);
        registry.register("fan_2", DeviceType::Fan);
        registry.retain(&BTreeSet::from(["fan_2".to_string()]));
        let ids: Vec<_> = registry.snapshot().into_iter().map(|h| h.device_id).collect();
        assert_eq!(ids, vec!["fan_2"]);
    }

    #[test]
    fn test_writer_stats() {
        let stats = WriterStats::default();
        stats.record_flush(10, 1, 2);
        stats.record_failure();
        stats.record_dropped(4);
        let snap = stats.snapshot();
        assert_eq!(snap.points_written, 10);
        assert_eq!(snap.feeding_written, 1);
        assert_eq!(snap.alarms_written, 2);
        assert_eq!(snap.failed_flushes, 1);
        assert_eq!(snap.dropped_points, 4);
    }
}
