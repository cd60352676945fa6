//! In-memory cabinet used by tests and the bench binary.
//!
//! [`SimulatedHardware`] is handed to the controller; a cloneable
//! [`SimulatorHandle`] stays with the test (or operator) to flip inputs,
//! set climate readings, inject faults and observe the outputs.

use super::{HardwareError, HardwareIo, InputBits};
use crate::channel::{BusAddress, RELAY_COUNT, TRANSISTOR_COUNT};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

const DEVICE: &str = "simulator";

/// First-order cabinet thermal model driven by the simulated outputs.
#[derive(Debug, Clone)]
pub struct ThermalModel {
    pub ambient_c: f32,
    /// Fraction of the gap to ambient closed per second.
    pub leakage_per_s: f32,
    /// Heat from the equipment, in degrees per second.
    pub load_c_per_s: f32,
    pub heater_c_per_s: f32,
    pub cooling_c_per_s: f32,
    pub fan_c_per_s: f32,
    /// Relay driving the heater, cooling unit and fans in the model.
    pub heater: Option<BusAddress>,
    pub cooling: Option<BusAddress>,
    pub fans: Vec<BusAddress>,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self {
            ambient_c: 18.0,
            leakage_per_s: 0.002,
            load_c_per_s: 0.02,
            heater_c_per_s: 0.05,
            cooling_c_per_s: 0.08,
            fan_c_per_s: 0.04,
            heater: Some(BusAddress::Relay(4)),
            cooling: Some(BusAddress::Relay(2)),
            fans: vec![BusAddress::Relay(5), BusAddress::Transistor(1)],
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_sensors: BTreeSet<String>,
    bank_read_failures: u32,
    failing_outputs: BTreeSet<BusAddress>,
    /// Chance, in percent, that any single call fails.
    random_error_percent: f32,
}

#[derive(Debug)]
struct SimState {
    inputs: InputBits,
    relays: [bool; RELAY_COUNT as usize],
    transistors: [bool; TRANSISTOR_COUNT as usize],
    temperatures: BTreeMap<String, f32>,
    humidities: BTreeMap<String, f32>,
    faults: Faults,
    thermal: Option<ThermalModel>,
    last_thermal_update: Instant,
    output_writes: u64,
    bank_reads: u64,
    released: bool,
    rng_state: u64,
}

impl SimState {
    fn new() -> Self {
        Self {
            inputs: 0,
            relays: [false; RELAY_COUNT as usize],
            transistors: [false; TRANSISTOR_COUNT as usize],
            temperatures: BTreeMap::new(),
            humidities: BTreeMap::new(),
            faults: Faults::default(),
            thermal: None,
            last_thermal_update: Instant::now(),
            output_writes: 0,
            bank_reads: 0,
            released: false,
            rng_state: 0x1234_5678_9ABC_DEF0,
        }
    }

    fn output(&self, address: BusAddress) -> bool {
        match address {
            BusAddress::Relay(n) => self.relays.get(usize::from(n).wrapping_sub(1)).copied().unwrap_or(false),
            BusAddress::Transistor(n) => self
                .transistors
                .get(usize::from(n).wrapping_sub(1))
                .copied()
                .unwrap_or(false),
            BusAddress::Input { .. } => false,
        }
    }

    // Linear congruential generator, fixed seed for reproducible runs
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.rng_state
    }

    fn random_failure(&mut self) -> bool {
        if self.faults.random_error_percent <= 0.0 {
            return false;
        }
        let sample = (self.next_random() >> 40) as f32 / (1u64 << 24) as f32;
        sample < self.faults.random_error_percent / 100.0
    }

    fn check_live(&mut self) -> Result<(), HardwareError> {
        if self.released {
            return Err(HardwareError::Released);
        }
        if self.random_failure() {
            return Err(HardwareError::Bus {
                device: DEVICE,
                reason: "injected random fault".to_string(),
            });
        }
        Ok(())
    }

    fn advance_thermal(&mut self) {
        let now = Instant::now();
        let dt_s = now.duration_since(self.last_thermal_update).as_secs_f32();
        self.last_thermal_update = now;

        let Some(model) = self.thermal.clone() else {
            return;
        };
        let heater_on = model.heater.is_some_and(|a| self.output(a));
        let cooling_on = model.cooling.is_some_and(|a| self.output(a));
        let fans_on = model.fans.iter().filter(|a| self.output(**a)).count() as f32;

        let drive = model.load_c_per_s
            + if heater_on { model.heater_c_per_s } else { 0.0 }
            - if cooling_on { model.cooling_c_per_s } else { 0.0 }
            - fans_on * model.fan_c_per_s;

        for temperature in self.temperatures.values_mut() {
            let leak = (model.ambient_c - *temperature) * model.leakage_per_s;
            *temperature += (drive + leak) * dt_s;
        }
    }
}

/// Simulated board. Zero error rate unless faults are injected.
pub struct SimulatedHardware {
    state: Arc<Mutex<SimState>>,
}

/// Test-side control of a [`SimulatedHardware`].
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHardware {
    pub fn new() -> (Self, SimulatorHandle) {
        let state = Arc::new(Mutex::new(SimState::new()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimulatorHandle { state },
        )
    }

    /// Simulator preloaded with a comfortable climate reading for every
    /// sensor id given.
    pub fn with_sensors<'a>(ids: impl IntoIterator<Item = &'a str>) -> (Self, SimulatorHandle) {
        let (hardware, handle) = Self::new();
        for id in ids {
            handle.set_temperature(id, 20.0);
            handle.set_humidity(id, 45.0);
        }
        (hardware, handle)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, HardwareError> {
        self.state.lock().map_err(|_| HardwareError::Bus {
            device: DEVICE,
            reason: "simulator state poisoned".to_string(),
        })
    }
}

fn set_bank(bank: &mut [bool], index: u8, on: bool) -> Result<(), HardwareError> {
    let slot = usize::from(index)
        .checked_sub(1)
        .and_then(|i| bank.get_mut(i))
        .ok_or(HardwareError::InvalidOutput(index))?;
    *slot = on;
    Ok(())
}

impl HardwareIo for SimulatedHardware {
    fn read_digital_bank(&mut self) -> Result<InputBits, HardwareError> {
        let mut state = self.lock()?;
        state.check_live()?;
        if state.faults.bank_read_failures > 0 {
            state.faults.bank_read_failures -= 1;
            return Err(HardwareError::Bus {
                device: DEVICE,
                reason: "injected input bank fault".to_string(),
            });
        }
        state.bank_reads += 1;
        Ok(state.inputs)
    }

    fn write_relay(&mut self, relay: u8, on: bool) -> Result<(), HardwareError> {
        let mut state = self.lock()?;
        state.check_live()?;
        if state.faults.failing_outputs.contains(&BusAddress::Relay(relay)) {
            return Err(HardwareError::Bus {
                device: DEVICE,
                reason: format!("injected write fault on K{relay}"),
            });
        }
        state.advance_thermal();
        set_bank(&mut state.relays, relay, on)?;
        state.output_writes += 1;
        Ok(())
    }

    fn write_transistor(&mut self, transistor: u8, on: bool) -> Result<(), HardwareError> {
        let mut state = self.lock()?;
        state.check_live()?;
        if state.faults.failing_outputs.contains(&BusAddress::Transistor(transistor)) {
            return Err(HardwareError::Bus {
                device: DEVICE,
                reason: format!("injected write fault on T{transistor}"),
            });
        }
        state.advance_thermal();
        set_bank(&mut state.transistors, transistor, on)?;
        state.output_writes += 1;
        Ok(())
    }

    fn read_temperature(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        let mut state = self.lock()?;
        state.check_live()?;
        if state.faults.failing_sensors.contains(sensor) {
            return Err(HardwareError::SensorRead {
                sensor: sensor.to_string(),
                reason: "no response".to_string(),
            });
        }
        state.advance_thermal();
        state
            .temperatures
            .get(sensor)
            .copied()
            .ok_or_else(|| HardwareError::UnknownSensor(sensor.to_string()))
    }

    fn read_humidity(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        let mut state = self.lock()?;
        state.check_live()?;
        if state.faults.failing_sensors.contains(sensor) {
            return Err(HardwareError::SensorRead {
                sensor: sensor.to_string(),
                reason: "no response".to_string(),
            });
        }
        state
            .humidities
            .get(sensor)
            .copied()
            .ok_or_else(|| HardwareError::UnknownSensor(sensor.to_string()))
    }

    fn release(&mut self) {
        if let Ok(mut state) = self.lock() {
            state.released = true;
        }
    }

    fn backend(&self) -> &'static str {
        DEVICE
    }
}

impl SimulatorHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the electrical level of an input pin.
    pub fn set_input_level(&self, address: BusAddress, high: bool) {
        if let Some(bit) = address.input_bit() {
            let mut state = self.state();
            if high {
                state.inputs |= 1 << bit;
            } else {
                state.inputs &= !(1 << bit);
            }
        }
    }

    pub fn set_input_bits(&self, bits: InputBits) {
        self.state().inputs = bits;
    }

    pub fn input_bits(&self) -> InputBits {
        self.state().inputs
    }

    pub fn set_temperature(&self, sensor: &str, celsius: f32) {
        self.state().temperatures.insert(sensor.to_string(), celsius);
    }

    pub fn temperature(&self, sensor: &str) -> Option<f32> {
        self.state().temperatures.get(sensor).copied()
    }

    pub fn set_humidity(&self, sensor: &str, percent: f32) {
        self.state().humidities.insert(sensor.to_string(), percent);
    }

    /// Make every read of `sensor` fail until cleared.
    pub fn fail_sensor(&self, sensor: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.faults.failing_sensors.insert(sensor.to_string());
        } else {
            state.faults.failing_sensors.remove(sensor);
        }
    }

    /// Fail the next `count` input bank reads.
    pub fn fail_bank_reads(&self, count: u32) {
        self.state().faults.bank_read_failures = count;
    }

    /// Make writes to one output fail until cleared.
    pub fn fail_output(&self, address: BusAddress, failing: bool) {
        let mut state = self.state();
        if failing {
            state.faults.failing_outputs.insert(address);
        } else {
            state.faults.failing_outputs.remove(&address);
        }
    }

    pub fn set_random_error_percent(&self, percent: f32) {
        self.state().faults.random_error_percent = percent.clamp(0.0, 100.0);
    }

    pub fn enable_thermal_model(&self, model: ThermalModel) {
        let mut state = self.state();
        state.thermal = Some(model);
        state.last_thermal_update = Instant::now();
    }

    pub fn output(&self, address: BusAddress) -> bool {
        self.state().output(address)
    }

    pub fn relay(&self, relay: u8) -> bool {
        self.output(BusAddress::Relay(relay))
    }

    pub fn transistor(&self, transistor: u8) -> bool {
        self.output(BusAddress::Transistor(transistor))
    }

    /// Successful output writes so far.
    pub fn output_writes(&self) -> u64 {
        self.state().output_writes
    }

    pub fn bank_reads(&self) -> u64 {
        self.state().bank_reads
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }
}
