//! Alarm limits per device category and field.

use super::descriptor::{DeviceType, FLOW_RATE, POWER, TEMPERATURE};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    Warning,
    Alarm,
}

impl AlarmLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmLevel::Warning => "warning",
            AlarmLevel::Alarm => "alarm",
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlarmLevel::Warning),
            "alarm" => Ok(AlarmLevel::Alarm),
            other => Err(format!("unknown alarm level: {}", other)),
        }
    }
}

/// Upper limits for one field of a device category.
///
/// A limit naming a `device_id` overrides the category limit for that device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmLimit {
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub field: String,
    pub warning_max: f64,
    pub alarm_max: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlarmLimit {
    pub fn new(device_type: DeviceType, field: &str, warning_max: f64, alarm_max: f64) -> Self {
        Self {
            device_type,
            device_id: None,
            field: field.to_string(),
            warning_max,
            alarm_max,
            enabled: true,
        }
    }

    /// Level `value` falls into; `None` within limits or when disabled.
    pub fn level(&self, value: f64) -> Option<AlarmLevel> {
        if !self.enabled {
            None
        } else if value > self.alarm_max {
            Some(AlarmLevel::Alarm)
        } else if value > self.warning_max {
            Some(AlarmLevel::Warning)
        } else {
            None
        }
    }

    /// The limit that `level` exceeds.
    pub fn threshold(&self, level: AlarmLevel) -> f64 {
        match level {
            AlarmLevel::Warning => self.warning_max,
            AlarmLevel::Alarm => self.alarm_max,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.warning_max.is_finite() || !self.alarm_max.is_finite() {
            return Err("limits must be finite".to_string());
        }
        if self.warning_max > self.alarm_max {
            return Err(format!(
                "warning_max {} is above alarm_max {}",
                self.warning_max, self.alarm_max
            ));
        }
        Ok(())
    }
}

/// Workshop defaults: kiln temperatures, motor and pump power, gas flow.
pub fn default_alarm_limits() -> Vec<AlarmLimit> {
    let mut limits = Vec::new();
    for hopper in [DeviceType::HopperWithWeighing, DeviceType::HopperNoWeighing] {
        limits.push(AlarmLimit::new(hopper, TEMPERATURE, 900.0, 1100.0));
        limits.push(AlarmLimit::new(hopper, POWER, 80.0, 100.0));
    }
    limits.push(AlarmLimit::new(DeviceType::KilnZone, TEMPERATURE, 1150.0, 1350.0));
    limits.push(AlarmLimit::new(DeviceType::Fan, POWER, 60.0, 80.0));
    limits.push(AlarmLimit::new(DeviceType::Pump, POWER, 30.0, 50.0));
    limits.push(AlarmLimit::new(DeviceType::GasMeter, FLOW_RATE, 100.0, 150.0));
    limits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        let limit = AlarmLimit::new(DeviceType::Fan, POWER, 60.0, 80.0);
        assert_eq!(limit.level(60.0), None);
        assert_eq!(limit.level(60.5), Some(AlarmLevel::Warning));
        assert_eq!(limit.level(80.0), Some(AlarmLevel::Warning));
        assert_eq!(limit.level(80.1), Some(AlarmLevel::Alarm));
        assert_eq!(limit.threshold(AlarmLevel::Alarm), 80.0);

        let disabled = AlarmLimit {
            enabled: false,
            ..limit
        };
        assert_eq!(disabled.level(500.0), None);
    }

    #[test]
    fn test_validate() {
        assert!(AlarmLimit::new(DeviceType::Pump, POWER, 30.0, 50.0).validate().is_ok());
        assert!(AlarmLimit::new(DeviceType::Pump, POWER, 60.0, 50.0).validate().is_err());
        assert!(AlarmLimit::new(DeviceType::Pump, POWER, f64::NAN, 50.0).validate().is_err());
    }

    #[test]
    fn test_level_wire_names() {
        assert_eq!(serde_json::to_string(&AlarmLevel::Warning).unwrap(), "\"warning\"");
        assert_eq!("alarm".parse::<AlarmLevel>().unwrap(), AlarmLevel::Alarm);
        assert!("critical".parse::<AlarmLevel>().is_err());
    }
}
