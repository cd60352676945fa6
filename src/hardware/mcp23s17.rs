//! Cabinet board backend: two MCP23S17 SPI port expanders, DHT11 climate
//! sensors and 1-Wire thermometers.
//!
//! Expander 1 drives the outputs (relays `K1..K8` on port A, transistors
//! `T1..T8` on port B). Expander 2 reads the inputs: door and flood contacts
//! on port A with pull-ups, the DIP switch on port B. Sensor ids with an
//! attached DHT11 read temperature and humidity from it; the rest fall back
//! to DS18B20 temperature over 1-Wire.

use super::dht11::{ClimateSensor, Dht11Reading};
use super::w1::W1Bus;
use super::{HardwareError, HardwareIo, InputBits};
use crate::channel::{RELAY_COUNT, TRANSISTOR_COUNT};
use embedded_hal::spi::SpiDevice;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

const OPCODE_WRITE: u8 = 0x40;
const OPCODE_READ: u8 = 0x41;

pub const IODIRA: u8 = 0x00;
pub const IODIRB: u8 = 0x01;
pub const IOCON: u8 = 0x0A;
pub const GPPUA: u8 = 0x0C;
pub const GPPUB: u8 = 0x0D;
pub const GPIOA: u8 = 0x12;
pub const GPIOB: u8 = 0x13;
pub const OLATA: u8 = 0x14;
pub const OLATB: u8 = 0x15;

/// IOCON.HAEN, written then read back to detect the chip.
const IOCON_PROBE: u8 = 0x08;
/// Door and flood contacts on A0..A5 need pull-ups.
const INPUT_PULLUPS_A: u8 = 0x3F;

/// Port A pin for relay `K<n>`.
const RELAY_PINS: [u8; RELAY_COUNT as usize] = [0, 1, 2, 3, 4, 5, 6, 7];
/// Port B pin for transistor `T<n>`; the board routes T1..T4 in reverse.
const TRANSISTOR_PINS: [u8; TRANSISTOR_COUNT as usize] = [3, 2, 1, 0, 4, 5, 6, 7];

/// One MCP23S17 on a dedicated SPI device (its own chip select).
#[derive(Debug)]
pub struct Mcp23s17<SPI> {
    spi: SPI,
    name: &'static str,
}

impl<SPI: SpiDevice> Mcp23s17<SPI> {
    pub fn new(spi: SPI, name: &'static str) -> Self {
        Self { spi, name }
    }

    pub fn write_register(&mut self, register: u8, value: u8) -> Result<(), HardwareError> {
        self.spi
            .write(&[OPCODE_WRITE, register, value])
            .map_err(|e| self.bus_error(&e))
    }

    pub fn read_register(&mut self, register: u8) -> Result<u8, HardwareError> {
        let mut frame = [OPCODE_READ, register, 0];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|e| self.bus_error(&e))?;
        Ok(frame[2])
    }

    /// Set IOCON.HAEN and check it reads back. An absent chip reads zeros.
    pub fn probe(&mut self) -> Result<(), HardwareError> {
        self.write_register(IOCON, IOCON_PROBE)?;
        if self.read_register(IOCON)? & IOCON_PROBE == 0 {
            return Err(HardwareError::NotDetected(self.name));
        }
        Ok(())
    }

    pub fn release(self) -> SPI {
        self.spi
    }

    fn bus_error(&self, error: &SPI::Error) -> HardwareError {
        HardwareError::Bus {
            device: self.name,
            reason: format!("{error:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub relays_active_low: bool,
    pub transistors_active_low: bool,
    pub w1: W1Bus,
    /// Sensor id to 1-Wire device id. Unmapped ids are used as device ids.
    pub thermometers: BTreeMap<String, String>,
    /// Sensor id to the GPIO line of its DHT11.
    pub dht11_pins: BTreeMap<String, u8>,
    /// A DHT11 reading younger than this is reused rather than waking the
    /// sensor again. The part needs about a second between reads.
    pub dht11_max_age: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            relays_active_low: false,
            transistors_active_low: false,
            w1: W1Bus::default(),
            thermometers: BTreeMap::new(),
            dht11_pins: [("battery".to_string(), 4), ("cabinet".to_string(), 5)].into_iter().collect(),
            dht11_max_age: Duration::from_secs(2),
        }
    }
}

struct ClimateChannel {
    device: Box<dyn ClimateSensor>,
    last: Option<(Instant, Dht11Reading)>,
}

/// The real cabinet board.
pub struct CabinetBus<SPI> {
    outputs: Mcp23s17<SPI>,
    inputs: Mcp23s17<SPI>,
    config: BusConfig,
    /// Logical output state per port, bit set = output on.
    relay_latch: u8,
    transistor_latch: u8,
    climate: BTreeMap<String, ClimateChannel>,
    released: bool,
}

fn encode(latch: u8, active_low: bool) -> u8 {
    if active_low {
        !latch
    } else {
        latch
    }
}

fn pin_for(pins: &[u8], index: u8) -> Result<u8, HardwareError> {
    usize::from(index)
        .checked_sub(1)
        .and_then(|i| pins.get(i))
        .copied()
        .ok_or(HardwareError::InvalidOutput(index))
}

impl<SPI: SpiDevice> CabinetBus<SPI> {
    /// Probe both expanders, configure directions and pull-ups, and drive
    /// every output off.
    pub fn open(output_spi: SPI, input_spi: SPI, config: BusConfig) -> Result<Self, HardwareError> {
        let mut outputs = Mcp23s17::new(output_spi, "output expander");
        let mut inputs = Mcp23s17::new(input_spi, "input expander");
        outputs.probe()?;
        inputs.probe()?;

        outputs.write_register(IODIRA, 0x00)?;
        outputs.write_register(IODIRB, 0x00)?;
        outputs.write_register(OLATA, encode(0, config.relays_active_low))?;
        outputs.write_register(OLATB, encode(0, config.transistors_active_low))?;

        inputs.write_register(IODIRA, 0xFF)?;
        inputs.write_register(GPPUA, INPUT_PULLUPS_A)?;
        inputs.write_register(IODIRB, 0xFF)?;
        inputs.write_register(GPPUB, 0xFF)?;

        Ok(Self {
            outputs,
            inputs,
            config,
            relay_latch: 0,
            transistor_latch: 0,
            climate: BTreeMap::new(),
            released: false,
        })
    }

    /// Attach the DHT11 for `sensor`. The id must have a pin in
    /// [`BusConfig::dht11_pins`].
    pub fn with_climate_sensor(
        mut self,
        sensor: impl Into<String>,
        device: impl ClimateSensor + 'static,
    ) -> Result<Self, HardwareError> {
        let sensor = sensor.into();
        let Some(pin) = self.config.dht11_pins.get(&sensor).copied() else {
            return Err(HardwareError::UnknownSensor(sensor));
        };
        debug!(sensor = %sensor, pin, "DHT11 attached");
        self.climate.insert(
            sensor,
            ClimateChannel {
                device: Box::new(device),
                last: None,
            },
        );
        Ok(self)
    }

    /// Latest DHT11 reading for `sensor`, or `None` if it has no DHT11.
    fn climate_reading(&mut self, sensor: &str) -> Option<Result<Dht11Reading, HardwareError>> {
        let max_age = self.config.dht11_max_age;
        let channel = self.climate.get_mut(sensor)?;
        let now = Instant::now();
        if let Some((at, reading)) = channel.last {
            if now.saturating_duration_since(at) < max_age {
                return Some(Ok(reading));
            }
        }
        Some(
            channel
                .device
                .read()
                .map(|reading| {
                    channel.last = Some((now, reading));
                    reading
                })
                .map_err(|e| HardwareError::SensorRead {
                    sensor: sensor.to_string(),
                    reason: e.to_string(),
                }),
        )
    }

    fn ensure_live(&self) -> Result<(), HardwareError> {
        if self.released {
            Err(HardwareError::Released)
        } else {
            Ok(())
        }
    }

    fn device_for<'a>(&'a self, sensor: &'a str) -> &'a str {
        self.config
            .thermometers
            .get(sensor)
            .map_or(sensor, String::as_str)
    }
}

impl<SPI: SpiDevice + Send> HardwareIo for CabinetBus<SPI> {
    fn read_digital_bank(&mut self) -> Result<InputBits, HardwareError> {
        self.ensure_live()?;
        let port_a = self.inputs.read_register(GPIOA)?;
        let port_b = self.inputs.read_register(GPIOB)?;
        Ok(InputBits::from(port_a) | (InputBits::from(port_b) << 8))
    }

    fn write_relay(&mut self, relay: u8, on: bool) -> Result<(), HardwareError> {
        self.ensure_live()?;
        let mask = 1 << pin_for(&RELAY_PINS, relay)?;
        let latch = if on { self.relay_latch | mask } else { self.relay_latch & !mask };
        self.outputs
            .write_register(OLATA, encode(latch, self.config.relays_active_low))?;
        self.relay_latch = latch;
        Ok(())
    }

    fn write_transistor(&mut self, transistor: u8, on: bool) -> Result<(), HardwareError> {
        self.ensure_live()?;
        let mask = 1 << pin_for(&TRANSISTOR_PINS, transistor)?;
        let latch = if on {
            self.transistor_latch | mask
        } else {
            self.transistor_latch & !mask
        };
        self.outputs
            .write_register(OLATB, encode(latch, self.config.transistors_active_low))?;
        self.transistor_latch = latch;
        Ok(())
    }

    fn read_temperature(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        self.ensure_live()?;
        match self.climate_reading(sensor) {
            Some(reading) => reading.map(|r| r.temperature_c),
            None => self.config.w1.read_celsius(self.device_for(sensor)),
        }
    }

    fn read_humidity(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        self.ensure_live()?;
        match self.climate_reading(sensor) {
            Some(reading) => reading.map(|r| r.humidity_pct),
            None => Err(HardwareError::Unsupported("humidity on the 1-Wire bus")),
        }
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn backend(&self) -> &'static str {
        "mcp23s17"
    }
}
