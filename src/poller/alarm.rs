//! Alarm limit checks on freshly decoded values.

use crate::db::AlarmEvent;
use crate::layout::{AlarmLevel, DeviceDescriptor, LayoutTable};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Raises an event when a field crosses its warning or alarm limit.
///
/// A (device, field, level) that keeps exceeding its limit is raised again
/// only once `repeat_after` has passed since it was last raised.
#[derive(Debug)]
pub struct AlarmChecker {
    repeat_after: chrono::Duration,
    last_raised: HashMap<(String, String, AlarmLevel), DateTime<Utc>>,
}

impl AlarmChecker {
    pub fn new(repeat_after: Duration) -> Self {
        Self {
            repeat_after: chrono::Duration::from_std(repeat_after)
                .unwrap_or(chrono::Duration::seconds(60)),
            last_raised: HashMap::new(),
        }
    }

    pub fn check(
        &mut self,
        table: &LayoutTable,
        device: &DeviceDescriptor,
        fields: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<AlarmEvent> {
        let mut events = Vec::new();
        for (field, &value) in fields {
            let Some(limit) = table.alarm_limit(device, field) else {
                continue;
            };
            let Some(level) = limit.level(value) else {
                continue;
            };

            let key = (device.device_id.clone(), field.clone(), level);
            if let Some(&raised) = self.last_raised.get(&key) {
                if now - raised < self.repeat_after {
                    continue;
                }
            }
            self.last_raised.insert(key, now);

            events.push(AlarmEvent {
                time: now,
                device_id: device.device_id.clone(),
                device_type: device.device_type,
                field: field.clone(),
                level,
                value,
                threshold: limit.threshold(level),
            });
        }
        events
    }
}
