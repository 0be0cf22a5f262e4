//! Plant configuration and the validated layout table built from it.

use super::alarms::{default_alarm_limits, AlarmLimit};
use super::descriptor::*;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Layout errors. All of them reject the configuration before use.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("failed to read plant file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plant file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate controller {0}")]
    DuplicateController(String),
    #[error("duplicate block {0}")]
    DuplicateBlock(u16),
    #[error("block {block_id} references unknown controller {controller}")]
    UnknownController { block_id: u16, controller: String },
    #[error("duplicate device {0}")]
    DuplicateDevice(String),
    #[error("device {device} has no block")]
    MissingBlock { device: String },
    #[error("device {device} references unknown block {block_id}")]
    UnknownBlock { device: String, block_id: u16 },
    #[error("device {device}: fields {first} and {second} overlap")]
    FieldOverlap {
        device: String,
        first: String,
        second: String,
    },
    #[error("device {device}: field {field} ends at byte {end}, block is {len} bytes")]
    FieldOutOfBounds {
        device: String,
        field: String,
        end: usize,
        len: usize,
    },
    #[error("device {device}: field {field} has width {width}, expected 2 or 4")]
    InvalidWidth {
        device: String,
        field: String,
        width: usize,
    },
    #[error("device {device}: duplicate field {field}")]
    DuplicateField { device: String, field: String },
    #[error("device {device} ({device_type}) is missing required field {field}")]
    MissingField {
        device: String,
        device_type: DeviceType,
        field: String,
    },
    #[error("aggregate {device}: {reason}")]
    InvalidAggregate { device: String, reason: String },
    #[error("alarm limit on {field}: {reason}")]
    InvalidAlarmLimit { field: String, reason: String },
}

/// A controller reachable over the field bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "default_slot")]
    pub slot: u16,
}

fn default_slot() -> u16 {
    1
}

/// A memory block read in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub block_id: u16,
    pub controller: String,
    #[serde(default)]
    pub offset: usize,
    pub length: usize,
}

/// Signal levels above which equipment counts as running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// kW
    pub power_threshold: f64,
    /// L/min
    pub flow_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            power_threshold: 0.01,
            flow_threshold: 0.01,
        }
    }
}

/// Hopper refill detection parameters (kg).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedingThresholds {
    pub rising_threshold: f64,
    pub min_feeding_threshold: f64,
}

impl Default for FeedingThresholds {
    fn default() -> Self {
        Self {
            rising_threshold: 5.0,
            min_feeding_threshold: 10.0,
        }
    }
}

fn default_ct_ratios() -> BTreeMap<DeviceType, f64> {
    BTreeMap::from([
        (DeviceType::HopperWithWeighing, 20.0),
        (DeviceType::HopperNoWeighing, 20.0),
        (DeviceType::KilnZone, 60.0),
        (DeviceType::Pump, 20.0),
        (DeviceType::Fan, 20.0),
    ])
}

/// Plant configuration as written in the plant file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    pub controllers: Vec<ControllerConfig>,
    pub blocks: Vec<BlockConfig>,
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_ct_ratios")]
    pub ct_ratios: BTreeMap<DeviceType, f64>,
    #[serde(default)]
    pub feeding: FeedingThresholds,
    #[serde(default = "default_alarm_limits")]
    pub alarms: Vec<AlarmLimit>,
}

impl PlantConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The ceramic workshop: hoppers and roller-kiln zones on the kiln
    /// controller, SCR gas meters, ammonia pumps and fans on the SCR one.
    pub fn workshop() -> Self {
        let controllers = vec![
            ControllerConfig {
                id: "kiln-plc".to_string(),
                address: "192.168.50.223".to_string(),
                rack: 0,
                slot: 1,
            },
            ControllerConfig {
                id: "scr-plc".to_string(),
                address: "192.168.50.224".to_string(),
                rack: 0,
                slot: 1,
            },
        ];

        let mut devices = Vec::new();

        // DB8: 32 bytes per hopper.
        let hoppers = [
            ("short_hopper_1", true),
            ("short_hopper_2", true),
            ("short_hopper_3", true),
            ("short_hopper_4", true),
            ("no_hopper_1", false),
            ("no_hopper_2", false),
            ("long_hopper_1", true),
            ("long_hopper_2", true),
            ("long_hopper_3", true),
        ];
        for (i, (id, weighing)) in hoppers.iter().enumerate() {
            let base = i * 32;
            let mut fields = Vec::new();
            if *weighing {
                fields.push(
                    FieldDescriptor::new(WEIGHT, "weigh", base, Encoding::Float32).unit("kg"),
                );
                fields.push(status_field("weigh_status", "weigh", base + 24));
            }
            fields.push(
                FieldDescriptor::new(TEMPERATURE, "thermal", base + 4, Encoding::Int16)
                    .scale(0.1)
                    .unit("°C"),
            );
            fields.extend(meter_fields(base + 8, "meter"));
            fields.push(status_field("meter_status", "meter", base + 28));

            devices.push(DeviceDescriptor {
                device_id: id.to_string(),
                device_type: if *weighing {
                    DeviceType::HopperWithWeighing
                } else {
                    DeviceType::HopperNoWeighing
                },
                block_id: Some(8),
                fields,
                constituents: vec![],
            });
        }

        // DB9: 24 bytes per roller-kiln zone.
        let mut zone_ids = Vec::new();
        for zone in 1..=6 {
            let base = (zone - 1) * 24;
            let module = format!("zone{}_meter", zone);
            let mut fields = vec![FieldDescriptor::new(
                TEMPERATURE,
                &format!("zone{}_thermal", zone),
                base,
                Encoding::Int16,
            )
            .scale(0.1)
            .unit("°C")];
            fields.extend(meter_fields(base + 4, &module));
            fields.push(status_field("meter_status", &module, base + 20));

            let id = format!("zone{}", zone);
            zone_ids.push(id.clone());
            devices.push(DeviceDescriptor {
                device_id: id,
                device_type: DeviceType::KilnZone,
                block_id: Some(9),
                fields,
                constituents: vec![],
            });
        }

        devices.push(DeviceDescriptor {
            device_id: "roller_kiln_total".to_string(),
            device_type: DeviceType::KilnZoneAggregate,
            block_id: None,
            fields: vec![],
            constituents: zone_ids,
        });

        // DB10: two gas meters (12 bytes) then two ammonia pumps (20 bytes).
        for n in 1..=2 {
            let base = (n - 1) * 12;
            devices.push(DeviceDescriptor {
                device_id: format!("scr_{}", n),
                device_type: DeviceType::GasMeter,
                block_id: Some(10),
                fields: vec![
                    FieldDescriptor::new(FLOW_RATE, "gas_meter", base, Encoding::UInt32)
                        .scale(0.001)
                        .unit("L/min"),
                    FieldDescriptor::new(GAS_TOTAL, "gas_meter", base + 4, Encoding::UInt32)
                        .scale(0.001)
                        .unit("m³"),
                    status_field("gas_status", "gas_meter", base + 8),
                ],
                constituents: vec![],
            });
        }
        for n in 1..=2 {
            let base = 24 + (n - 1) * 20;
            let mut fields = meter_fields(base, "meter");
            fields.push(status_field("meter_status", "meter", base + 16));
            devices.push(DeviceDescriptor {
                device_id: format!("scr_{}_pump", n),
                device_type: DeviceType::Pump,
                block_id: Some(10),
                fields,
                constituents: vec![],
            });
        }

        // DB11: 20 bytes per fan.
        for n in 1..=2 {
            let base = (n - 1) * 20;
            let mut fields = meter_fields(base, "meter");
            fields.push(status_field("meter_status", "meter", base + 16));
            devices.push(DeviceDescriptor {
                device_id: format!("fan_{}", n),
                device_type: DeviceType::Fan,
                block_id: Some(11),
                fields,
                constituents: vec![],
            });
        }

        Self {
            controllers,
            blocks: vec![
                whole_block(8, "kiln-plc", 288),
                whole_block(9, "kiln-plc", 144),
                whole_block(10, "scr-plc", 64),
                whole_block(11, "scr-plc", 40),
            ],
            devices,
            thresholds: Thresholds::default(),
            ct_ratios: default_ct_ratios(),
            feeding: FeedingThresholds::default(),
            alarms: default_alarm_limits(),
        }
    }
}

fn whole_block(block_id: u16, controller: &str, length: usize) -> BlockConfig {
    BlockConfig {
        block_id,
        controller: controller.to_string(),
        offset: 0,
        length,
    }
}

/// Three-phase meter: phase A voltage and current, total power, imported energy.
fn meter_fields(base: usize, module: &str) -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("Ua_0", module, base, Encoding::Float32)
            .scale(0.1)
            .unit("V"),
        FieldDescriptor::new("I_0", module, base + 4, Encoding::Float32)
            .scale(0.001)
            .unit("A")
            .ct_scaled(),
        FieldDescriptor::new(POWER, module, base + 8, Encoding::Float32)
            .scale(0.0001)
            .unit("kW")
            .ct_scaled(),
        FieldDescriptor::new(ENERGY, module, base + 12, Encoding::Float32)
            .unit("kWh")
            .ct_scaled(),
    ]
}

fn status_field(name: &str, module: &str, offset: usize) -> FieldDescriptor {
    FieldDescriptor::new(name, module, offset, Encoding::StatusFlags)
}

/// Validated, immutable register map for the whole plant.
#[derive(Debug, Clone)]
pub struct LayoutTable {
    controllers: BTreeMap<String, ControllerConfig>,
    blocks: BTreeMap<u16, BlockConfig>,
    devices: BTreeMap<String, DeviceDescriptor>,
    thresholds: Thresholds,
    feeding: FeedingThresholds,
    alarms: Vec<AlarmLimit>,
}

impl LayoutTable {
    /// Validate a plant configuration and fold CT ratios into field scales.
    pub fn build(config: PlantConfig) -> Result<Self, LayoutError> {
        let mut controllers = BTreeMap::new();
        for c in config.controllers {
            if controllers.contains_key(&c.id) {
                return Err(LayoutError::DuplicateController(c.id));
            }
            controllers.insert(c.id.clone(), c);
        }

        let mut blocks = BTreeMap::new();
        for b in config.blocks {
            if !controllers.contains_key(&b.controller) {
                return Err(LayoutError::UnknownController {
                    block_id: b.block_id,
                    controller: b.controller,
                });
            }
            if blocks.contains_key(&b.block_id) {
                return Err(LayoutError::DuplicateBlock(b.block_id));
            }
            blocks.insert(b.block_id, b);
        }

        let mut devices = BTreeMap::new();
        for mut device in config.devices {
            if devices.contains_key(&device.device_id) {
                return Err(LayoutError::DuplicateDevice(device.device_id));
            }
            if !device.is_derived() {
                validate_measured(&device, &blocks)?;
                let ratio = config.ct_ratios.get(&device.device_type).copied().unwrap_or(1.0);
                for field in device.fields.iter_mut().filter(|f| f.ct_scaled) {
                    field.scale *= ratio;
                }
            }
            devices.insert(device.device_id.clone(), device);
        }

        for device in devices.values().filter(|d| d.is_derived()) {
            validate_aggregate(device, &devices)?;
        }

        for limit in &config.alarms {
            validate_alarm_limit(limit, &devices)?;
        }

        Ok(Self {
            controllers,
            blocks,
            devices,
            thresholds: config.thresholds,
            feeding: config.feeding,
            alarms: config.alarms,
        })
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerConfig> {
        self.controllers.values()
    }

    pub fn controller(&self, id: &str) -> Option<&ControllerConfig> {
        self.controllers.get(id)
    }

    pub fn block(&self, block_id: u16) -> Option<&BlockConfig> {
        self.blocks.get(&block_id)
    }

    pub fn blocks_for_controller<'a>(
        &'a self,
        controller_id: &'a str,
    ) -> impl Iterator<Item = &'a BlockConfig> + 'a {
        self.blocks
            .values()
            .filter(move |b| b.controller == controller_id)
    }

    /// Devices in id order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(device_id)
    }

    pub fn devices_in_block(&self, block_id: u16) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices
            .values()
            .filter(move |d| d.block_id == Some(block_id))
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn feeding(&self) -> FeedingThresholds {
        self.feeding
    }

    pub fn alarm_limits(&self) -> &[AlarmLimit] {
        &self.alarms
    }

    /// Limit for one field of a device: a device-specific limit first, then
    /// the category limit.
    pub fn alarm_limit(&self, device: &DeviceDescriptor, field: &str) -> Option<&AlarmLimit> {
        let matching = |l: &&AlarmLimit| l.field == field && l.device_type == device.device_type;
        self.alarms
            .iter()
            .filter(matching)
            .find(|l| l.device_id.as_deref() == Some(device.device_id.as_str()))
            .or_else(|| {
                self.alarms
                    .iter()
                    .filter(matching)
                    .find(|l| l.device_id.is_none())
            })
    }
}

fn validate_alarm_limit(
    limit: &AlarmLimit,
    devices: &BTreeMap<String, DeviceDescriptor>,
) -> Result<(), LayoutError> {
    let invalid = |reason: String| LayoutError::InvalidAlarmLimit {
        field: limit.field.clone(),
        reason,
    };

    limit.validate().map_err(invalid)?;
    if let Some(id) = &limit.device_id {
        match devices.get(id) {
            Some(device) if device.device_type == limit.device_type => {}
            Some(device) => {
                return Err(invalid(format!(
                    "{} is a {}, not a {}",
                    id, device.device_type, limit.device_type
                )))
            }
            None => return Err(invalid(format!("unknown device {}", id))),
        }
    }
    Ok(())
}

fn validate_measured(
    device: &DeviceDescriptor,
    blocks: &BTreeMap<u16, BlockConfig>,
) -> Result<(), LayoutError> {
    let block_id = device.block_id.ok_or_else(|| LayoutError::MissingBlock {
        device: device.device_id.clone(),
    })?;
    let block = blocks.get(&block_id).ok_or_else(|| LayoutError::UnknownBlock {
        device: device.device_id.clone(),
        block_id,
    })?;

    let mut names = HashSet::new();
    for field in &device.fields {
        if !names.insert(field.name.as_str()) {
            return Err(LayoutError::DuplicateField {
                device: device.device_id.clone(),
                field: field.name.clone(),
            });
        }
        if field.width != 2 && field.width != 4 {
            return Err(LayoutError::InvalidWidth {
                device: device.device_id.clone(),
                field: field.name.clone(),
                width: field.width,
            });
        }
        if field.end() > block.length {
            return Err(LayoutError::FieldOutOfBounds {
                device: device.device_id.clone(),
                field: field.name.clone(),
                end: field.end(),
                len: block.length,
            });
        }
    }

    if let Some((first, second)) = device.find_overlap() {
        return Err(LayoutError::FieldOverlap {
            device: device.device_id.clone(),
            first: first.name.clone(),
            second: second.name.clone(),
        });
    }

    for required in device.device_type.required_fields() {
        if device.field(required).map_or(true, |f| f.is_status()) {
            return Err(LayoutError::MissingField {
                device: device.device_id.clone(),
                device_type: device.device_type,
                field: required.to_string(),
            });
        }
    }

    Ok(())
}

fn validate_aggregate(
    device: &DeviceDescriptor,
    devices: &BTreeMap<String, DeviceDescriptor>,
) -> Result<(), LayoutError> {
    let invalid = |reason: String| LayoutError::InvalidAggregate {
        device: device.device_id.clone(),
        reason,
    };

    if device.constituents.is_empty() {
        return Err(invalid("no constituent zones".to_string()));
    }
    if !device.fields.is_empty() {
        return Err(invalid("derived devices cannot declare fields".to_string()));
    }
    for id in &device.constituents {
        match devices.get(id) {
            Some(zone) if zone.device_type == DeviceType::KilnZone => {}
            Some(other) => {
                return Err(invalid(format!("{} is a {}, not a kiln zone", id, other.device_type)))
            }
            None => return Err(invalid(format!("unknown constituent {}", id))),
        }
    }
    Ok(())
}
