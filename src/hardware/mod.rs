//! Hardware abstraction for the cabinet I/O bus.
//!
//! The controller talks to the board only through [`HardwareIo`]. Two
//! implementations ship with the crate: [`simulator::SimulatedHardware`] for
//! tests and bench runs, and [`mcp23s17::CabinetBus`] for the real board
//! (two SPI port expanders, DHT11 climate sensors and 1-Wire thermometers).

pub mod dht11;
pub mod mcp23s17;
pub mod simulator;
pub mod w1;

use crate::channel::BusAddress;

/// Both input ports packed into one word: port A in bits 0..7, port B in 8..15.
pub type InputBits = u16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("bus transfer failed on {device}: {reason}")]
    Bus { device: &'static str, reason: String },
    #[error("{0} did not respond to probe")]
    NotDetected(&'static str),
    #[error("unknown sensor `{0}`")]
    UnknownSensor(String),
    #[error("sensor `{sensor}` read failed: {reason}")]
    SensorRead { sensor: String, reason: String },
    #[error("{0} is not supported by this hardware")]
    Unsupported(&'static str),
    #[error("output index {0} is out of range")]
    InvalidOutput(u8),
    #[error("hardware has been released")]
    Released,
}

/// Synchronous access to inputs, outputs and sensors.
///
/// Calls may block briefly on the bus. They are only made from the control
/// loop's tick, which runs off the async executor. Errors are reported to the
/// caller and are never fatal to the implementation; the next call retries.
pub trait HardwareIo: Send {
    /// Read the raw level of every digital input.
    fn read_digital_bank(&mut self) -> Result<InputBits, HardwareError>;

    /// Drive relay `K<relay>` (1-based).
    fn write_relay(&mut self, relay: u8, on: bool) -> Result<(), HardwareError>;

    /// Drive transistor `T<transistor>` (1-based).
    fn write_transistor(&mut self, transistor: u8, on: bool) -> Result<(), HardwareError>;

    fn read_temperature(&mut self, sensor: &str) -> Result<f32, HardwareError>;

    fn read_humidity(&mut self, sensor: &str) -> Result<f32, HardwareError>;

    /// Give the bus back. Outputs keep their last commanded level.
    fn release(&mut self) {}

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Drive whichever bank `address` lives on.
pub fn write_output(
    hardware: &mut dyn HardwareIo,
    address: BusAddress,
    on: bool,
) -> Result<(), HardwareError> {
    match address {
        BusAddress::Relay(n) => hardware.write_relay(n, on),
        BusAddress::Transistor(n) => hardware.write_transistor(n, on),
        BusAddress::Input { .. } => Err(HardwareError::Unsupported("writing an input pin")),
    }
}
