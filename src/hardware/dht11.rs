//! DHT11 temperature and humidity sensors on a single open-drain GPIO line.
//!
//! The host holds the line low for 18 ms, releases it, and the sensor
//! answers with an 80 us low / 80 us high preamble followed by 40 bits.
//! Each bit is a 50 us low gap and a high pulse of about 27 us (zero) or
//! 70 us (one). The fifth byte is the sum of the first four.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

const START_LOW_MS: u32 = 18;
/// Longest a single level may last before the read is abandoned.
const LEVEL_TIMEOUT_US: u32 = 100;
/// Past the end of a zero pulse, well inside a one pulse.
const BIT_SAMPLE_US: u32 = 35;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dht11Reading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Dht11Error {
    #[error("no response during {0}")]
    Timeout(&'static str),
    #[error("checksum mismatch: frame says {expected:#04x}, data sums to {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("humidity {0}% is out of range")]
    OutOfRange(u8),
    #[error("pin error: {0}")]
    Pin(String),
}

/// Decode the five data bytes: humidity, humidity tenths, temperature,
/// temperature tenths (bit 7 = below zero), checksum.
pub fn decode_frame(frame: [u8; 5]) -> Result<Dht11Reading, Dht11Error> {
    let actual = frame[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if actual != frame[4] {
        return Err(Dht11Error::Checksum {
            expected: frame[4],
            actual,
        });
    }
    if frame[0] > 100 {
        return Err(Dht11Error::OutOfRange(frame[0]));
    }

    let humidity_pct = f32::from(frame[0]) + f32::from(frame[1]) / 10.0;
    let magnitude = f32::from(frame[2]) + f32::from(frame[3] & 0x7F) / 10.0;
    let temperature_c = if frame[3] & 0x80 == 0 { magnitude } else { -magnitude };
    Ok(Dht11Reading {
        temperature_c,
        humidity_pct,
    })
}

/// Anything that can produce one combined climate reading. Boxed by
/// [`super::mcp23s17::CabinetBus`] per sensor id.
pub trait ClimateSensor: Send {
    fn read(&mut self) -> Result<Dht11Reading, Dht11Error>;
}

fn pin_error<E: embedded_hal::digital::Error>(error: &E) -> Dht11Error {
    Dht11Error::Pin(format!("{:?}", error.kind()))
}

/// One DHT11 on `pin`. The pin must be open-drain with a pull-up, so that
/// driving it high releases the line to the sensor.
#[derive(Debug)]
pub struct Dht11<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> Dht11<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }

    pub fn read(&mut self) -> Result<Dht11Reading, Dht11Error> {
        self.pin.set_low().map_err(|e| pin_error(&e))?;
        self.delay.delay_ms(START_LOW_MS);
        self.pin.set_high().map_err(|e| pin_error(&e))?;

        self.wait_for(false, "start")?;
        self.wait_for(true, "preamble")?;
        self.wait_for(false, "preamble")?;

        let mut frame = [0u8; 5];
        for bit in 0..40 {
            self.wait_for(true, "data")?;
            self.delay.delay_us(BIT_SAMPLE_US);
            if self.pin.is_high().map_err(|e| pin_error(&e))? {
                frame[bit / 8] |= 0x80 >> (bit % 8);
                self.wait_for(false, "data")?;
            }
        }
        decode_frame(frame)
    }

    fn wait_for(&mut self, high: bool, stage: &'static str) -> Result<(), Dht11Error> {
        for _ in 0..LEVEL_TIMEOUT_US {
            if self.pin.is_high().map_err(|e| pin_error(&e))? == high {
                return Ok(());
            }
            self.delay.delay_us(1);
        }
        Err(Dht11Error::Timeout(stage))
    }
}

impl<P, D> ClimateSensor for Dht11<P, D>
where
    P: InputPin + OutputPin + Send,
    D: DelayNs + Send,
{
    fn read(&mut self) -> Result<Dht11Reading, Dht11Error> {
        Dht11::read(self)
    }
}
