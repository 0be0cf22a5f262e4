//! Device and field descriptors.
//!
//! A descriptor says where a device's values live inside a controller block
//! and how the raw bytes turn into engineering units.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Total active power of an electrical meter (kW).
pub const POWER: &str = "Pt";
/// Cumulative imported active energy (kWh).
pub const ENERGY: &str = "ImpEp";
/// Instantaneous gas flow (L/min).
pub const FLOW_RATE: &str = "flow_rate";
/// Cumulative gas volume (m³).
pub const GAS_TOTAL: &str = "total_flow";
/// Net hopper weight (kg).
pub const WEIGHT: &str = "weight";
/// Kiln or hopper temperature (°C).
pub const TEMPERATURE: &str = "temperature";

/// Monitored equipment category.
///
/// Declaration order is the report grouping order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    HopperWithWeighing,
    HopperNoWeighing,
    KilnZone,
    KilnZoneAggregate,
    GasMeter,
    Pump,
    Fan,
}

impl DeviceType {
    pub const ALL: [DeviceType; 7] = [
        DeviceType::HopperWithWeighing,
        DeviceType::HopperNoWeighing,
        DeviceType::KilnZone,
        DeviceType::KilnZoneAggregate,
        DeviceType::GasMeter,
        DeviceType::Pump,
        DeviceType::Fan,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::HopperWithWeighing => "hopper_with_weighing",
            DeviceType::HopperNoWeighing => "hopper_no_weighing",
            DeviceType::KilnZone => "kiln_zone",
            DeviceType::KilnZoneAggregate => "kiln_zone_aggregate",
            DeviceType::GasMeter => "gas_meter",
            DeviceType::Pump => "pump",
            DeviceType::Fan => "fan",
        }
    }

    /// Which report facets apply to this category.
    pub const fn facets(self) -> FacetSet {
        match self {
            DeviceType::HopperWithWeighing => FacetSet {
                feeding: true,
                electricity: true,
                gas: false,
                runtime: RuntimeSignal::Power,
            },
            DeviceType::HopperNoWeighing
            | DeviceType::KilnZone
            | DeviceType::Pump
            | DeviceType::Fan => FacetSet {
                feeding: false,
                electricity: true,
                gas: false,
                runtime: RuntimeSignal::Power,
            },
            DeviceType::KilnZoneAggregate => FacetSet {
                feeding: false,
                electricity: true,
                gas: false,
                runtime: RuntimeSignal::ZoneMean,
            },
            DeviceType::GasMeter => FacetSet {
                feeding: false,
                electricity: false,
                gas: true,
                runtime: RuntimeSignal::Flow,
            },
        }
    }

    /// Fields a measured device of this category must expose.
    pub fn required_fields(self) -> Vec<&'static str> {
        let facets = self.facets();
        let mut fields = Vec::new();
        if facets.runtime == RuntimeSignal::ZoneMean {
            return fields;
        }
        if facets.electricity {
            fields.push(ENERGY);
        }
        if facets.gas {
            fields.push(GAS_TOTAL);
        }
        if facets.feeding {
            fields.push(WEIGHT);
        }
        match facets.runtime {
            RuntimeSignal::Power => fields.push(POWER),
            RuntimeSignal::Flow => fields.push(FLOW_RATE),
            RuntimeSignal::ZoneMean => {}
        }
        fields
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown device type: {}", s))
    }
}

/// Signal a runtime estimate is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSignal {
    /// `Pt` above the power threshold.
    Power,
    /// `flow_rate` above the flow threshold.
    Flow,
    /// Mean of the constituent zones' runtimes.
    ZoneMean,
}

/// Facet applicability for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetSet {
    pub feeding: bool,
    pub electricity: bool,
    pub gas: bool,
    pub runtime: RuntimeSignal,
}

/// How the bytes of a field are interpreted. All multi-byte values are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    /// 4-byte module health record: error flag byte, spare byte, status word.
    StatusFlags,
}

impl Encoding {
    pub fn width(self) -> usize {
        match self {
            Encoding::Int16 | Encoding::UInt16 => 2,
            Encoding::Int32 | Encoding::UInt32 | Encoding::Float32 | Encoding::StatusFlags => 4,
        }
    }
}

/// One value inside a controller block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Logical sub-module the field belongs to (meter, weigh, gas_meter...).
    pub module: String,
    /// Offset from the start of the block as read.
    pub byte_offset: usize,
    pub width: usize,
    pub encoding: Encoding,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
    /// Multiply the category's current-transformer ratio into `scale` when
    /// the layout table is built.
    #[serde(default)]
    pub ct_scaled: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl FieldDescriptor {
    pub fn new(name: &str, module: &str, byte_offset: usize, encoding: Encoding) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            byte_offset,
            width: encoding.width(),
            encoding,
            scale: 1.0,
            unit: String::new(),
            ct_scaled: false,
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn ct_scaled(mut self) -> Self {
        self.ct_scaled = true;
        self
    }

    pub fn end(&self) -> usize {
        self.byte_offset + self.width
    }

    pub fn is_status(&self) -> bool {
        self.encoding == Encoding::StatusFlags
    }

    fn overlaps(&self, other: &FieldDescriptor) -> bool {
        self.byte_offset < other.end() && other.byte_offset < self.end()
    }
}

/// A monitored device and where its data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_type: DeviceType,
    /// Controller block holding the device's data. Derived devices have none.
    #[serde(default)]
    pub block_id: Option<u16>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    /// Devices a derived aggregate is computed from.
    #[serde(default)]
    pub constituents: Vec<String>,
}

impl DeviceDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_derived(&self) -> bool {
        self.device_type == DeviceType::KilnZoneAggregate
    }

    /// First pair of overlapping fields, if any.
    pub fn find_overlap(&self) -> Option<(&FieldDescriptor, &FieldDescriptor)> {
        let mut sorted: Vec<&FieldDescriptor> = self.fields.iter().collect();
        sorted.sort_by_key(|f| f.byte_offset);
        sorted
            .windows(2)
            .find(|pair| pair[0].overlaps(pair[1]))
            .map(|pair| (pair[0], pair[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facet_table() {
        let gas = DeviceType::GasMeter.facets();
        assert!(gas.gas && !gas.electricity && !gas.feeding);
        assert_eq!(gas.runtime, RuntimeSignal::Flow);

        let hopper = DeviceType::HopperNoWeighing.facets();
        assert!(hopper.electricity && !hopper.feeding);

        assert!(DeviceType::HopperWithWeighing.facets().feeding);
        assert_eq!(
            DeviceType::KilnZoneAggregate.facets().runtime,
            RuntimeSignal::ZoneMean
        );
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(DeviceType::GasMeter.required_fields(), vec![GAS_TOTAL, FLOW_RATE]);
        assert_eq!(
            DeviceType::HopperWithWeighing.required_fields(),
            vec![ENERGY, WEIGHT, POWER]
        );
        assert!(DeviceType::KilnZoneAggregate.required_fields().is_empty());
    }

    #[test]
    fn test_device_type_names_round_trip_through_from_str() {
        for t in DeviceType::ALL {
            assert_eq!(t.as_str().parse::<DeviceType>().unwrap(), t);
        }
        assert!("kiln".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_find_overlap() {
        let mut device = DeviceDescriptor {
            device_id: "fan_1".to_string(),
            device_type: DeviceType::Fan,
            block_id: Some(11),
            fields: vec![
                FieldDescriptor::new("a", "meter", 0, Encoding::Float32),
                FieldDescriptor::new("b", "meter", 4, Encoding::Int16),
            ],
            constituents: vec![],
        };
        assert!(device.find_overlap().is_none());

        device.fields.push(FieldDescriptor::new("c", "meter", 5, Encoding::Int16));
        let (a, b) = device.find_overlap().unwrap();
        assert_eq!((a.name.as_str(), b.name.as_str()), ("b", "c"));
    }
}
