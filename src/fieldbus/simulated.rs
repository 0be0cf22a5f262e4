//! Simulated controllers.
//!
//! Synthesises raw blocks from the active layout so the whole pipeline can run
//! without plant hardware. Values follow the shape of the real signals: noisy
//! power while running, counters that only go up, hoppers that drain and get
//! refilled.

use super::{FieldBus, FieldBusError};
use crate::codec::{encode_field, encode_status, ModuleStatus};
use crate::layout::{
    ControllerConfig, DeviceDescriptor, DeviceType, LayoutHandle, ENERGY, FLOW_RATE, GAS_TOTAL,
    POWER, WEIGHT,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;

/// Seconds of plant time that pass between two reads of a device.
const SIM_STEP_SECS: f64 = 6.0;

#[derive(Debug, Clone, Default)]
struct DeviceSim {
    running: bool,
    power: f64,
    energy: f64,
    flow: f64,
    gas_total: f64,
    weight: f64,
    /// kg still to be added by an ongoing refill
    refill_left: f64,
}

struct SimState {
    rng: StdRng,
    devices: HashMap<String, DeviceSim>,
}

/// Field bus backed by generated data.
pub struct SimulatedBus {
    layout: LayoutHandle,
    error_rate: f64,
    state: Mutex<SimState>,
}

/// Session with one simulated controller.
#[derive(Debug, Clone)]
pub struct SimSession {
    controller: String,
}

impl SimulatedBus {
    pub fn new(layout: LayoutHandle, error_rate: f64) -> Self {
        Self::with_rng(layout, error_rate, StdRng::from_entropy())
    }

    /// Deterministic bus for tests.
    pub fn with_seed(layout: LayoutHandle, error_rate: f64, seed: u64) -> Self {
        Self::with_rng(layout, error_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(layout: LayoutHandle, error_rate: f64, rng: StdRng) -> Self {
        Self {
            layout,
            error_rate: error_rate.clamp(0.0, 1.0),
            state: Mutex::new(SimState {
                rng,
                devices: HashMap::new(),
            }),
        }
    }

    fn fail(&self, state: &mut SimState) -> bool {
        self.error_rate > 0.0 && state.rng.gen_bool(self.error_rate)
    }

    fn render_block(&self, block_id: u16, length: usize) -> Result<Vec<u8>, FieldBusError> {
        let table = self.layout.current();
        let mut buf = vec![0u8; length];
        let mut state = self.state.lock().unwrap();
        let SimState { rng, devices } = &mut *state;

        for device in table.devices_in_block(block_id) {
            let sim = devices
                .entry(device.device_id.clone())
                .or_insert_with(|| initial_state(device, rng));
            step(device.device_type, sim, rng);
            write_device(&mut buf, device, sim, rng, self.error_rate).map_err(|e| {
                FieldBusError::Read {
                    block_id,
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(buf)
    }
}

impl FieldBus for SimulatedBus {
    type Session = SimSession;

    async fn connect(&self, controller: &ControllerConfig) -> Result<SimSession, FieldBusError> {
        let known = self.layout.current().controller(&controller.id).is_some();
        let refused = {
            let mut state = self.state.lock().unwrap();
            self.fail(&mut state)
        };
        if !known || refused {
            return Err(FieldBusError::Connection {
                controller: controller.id.clone(),
                reason: if known {
                    "connection refused".to_string()
                } else {
                    "no such controller".to_string()
                },
            });
        }
        Ok(SimSession {
            controller: controller.id.clone(),
        })
    }

    async fn read_block(
        &self,
        session: &mut SimSession,
        block_id: u16,
        offset: usize,
        length: usize,
    ) -> Result<Vec<u8>, FieldBusError> {
        let block_len = match self.layout.current().block(block_id) {
            Some(block) if block.controller == session.controller => block.length,
            _ => {
                return Err(FieldBusError::Read {
                    block_id,
                    reason: format!("block not present on {}", session.controller),
                })
            }
        };

        let dropped = {
            let mut state = self.state.lock().unwrap();
            self.fail(&mut state)
        };
        if dropped {
            return Err(FieldBusError::Read {
                block_id,
                reason: "simulated transport error".to_string(),
            });
        }

        let full = self.render_block(block_id, block_len)?;
        let end = (offset + length).min(full.len());
        Ok(full.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default())
    }
}

fn initial_state(device: &DeviceDescriptor, rng: &mut StdRng) -> DeviceSim {
    DeviceSim {
        running: rng.gen_bool(0.8),
        energy: rng.gen_range(1_000.0..50_000.0),
        gas_total: rng.gen_range(100.0..5_000.0),
        weight: if device.field(WEIGHT).is_some() {
            rng.gen_range(150.0..400.0)
        } else {
            0.0
        },
        ..Default::default()
    }
}

/// Advance one device by one poll period.
fn step(device_type: DeviceType, sim: &mut DeviceSim, rng: &mut StdRng) {
    if rng.gen_bool(0.02) {
        sim.running = !sim.running;
    }

    let rated_kw = match device_type {
        DeviceType::KilnZone => 45.0,
        DeviceType::Fan => 18.0,
        DeviceType::Pump => 4.0,
        _ => 7.5,
    };
    sim.power = if sim.running {
        rated_kw * rng.gen_range(0.85..1.05)
    } else {
        0.0
    };
    sim.energy += sim.power * SIM_STEP_SECS / 3600.0;

    sim.flow = if sim.running {
        rng.gen_range(20.0..40.0)
    } else {
        0.0
    };
    // L/min over one step, in m³
    sim.gas_total += sim.flow * SIM_STEP_SECS / 60.0 / 1000.0;

    if sim.refill_left > 0.0 {
        let added = sim.refill_left.min(60.0);
        sim.weight += added;
        sim.refill_left -= added;
    } else if sim.weight > 0.0 {
        sim.weight = (sim.weight - rng.gen_range(0.2..0.8)).max(0.0);
        if sim.weight < 100.0 {
            sim.refill_left = rng.gen_range(200.0..350.0);
        }
    }
}

fn write_device(
    buf: &mut [u8],
    device: &DeviceDescriptor,
    sim: &DeviceSim,
    rng: &mut StdRng,
    error_rate: f64,
) -> Result<(), crate::codec::FieldError> {
    for field in &device.fields {
        if field.is_status() {
            let status = ModuleStatus {
                error: error_rate > 0.0 && rng.gen_bool((error_rate / 2.0).min(1.0)),
                status_word: 0,
            };
            encode_status(buf, field, status)?;
            continue;
        }

        let value = match field.name.as_str() {
            POWER => sim.power,
            ENERGY => sim.energy,
            FLOW_RATE => sim.flow,
            GAS_TOTAL => sim.gas_total,
            WEIGHT => sim.weight,
            "Ua_0" => rng.gen_range(218.0..232.0),
            "I_0" => sim.power * 1000.0 / (3.0 * 220.0),
            "temperature" if device.device_type == DeviceType::KilnZone => {
                rng.gen_range(850.0..1180.0)
            }
            "temperature" => rng.gen_range(55.0..80.0),
            _ => 0.0,
        };
        encode_field(buf, field, value)?;
    }
    Ok(())
}
