//! Channel model: board labels for inputs (`A0..B7`), relays (`K1..K8`)
//! and transistors (`T1..T8`), plus the roles outputs play in the rules.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const PINS_PER_PORT: u8 = 8;
pub const RELAY_COUNT: u8 = 8;
pub const TRANSISTOR_COUNT: u8 = 8;

// Both input ports are packed into one `InputBits` word.
const_assert!((PINS_PER_PORT as usize) * 2 <= 16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Port {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BusAddress {
    Input { port: Port, pin: u8 },
    /// Relay `K<n>`, 1-based.
    Relay(u8),
    /// Transistor `T<n>`, 1-based.
    Transistor(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bus address `{0}` (expected A0..A7, B0..B7, K1..K8 or T1..T8)")]
pub struct AddressParseError(pub String);

impl BusAddress {
    /// Bit position of an input inside the packed digital bank.
    pub fn input_bit(self) -> Option<u8> {
        match self {
            BusAddress::Input { port: Port::A, pin } => Some(pin),
            BusAddress::Input { port: Port::B, pin } => Some(PINS_PER_PORT + pin),
            _ => None,
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, BusAddress::Input { .. })
    }

    pub fn is_output(self) -> bool {
        !self.is_input()
    }
}

impl FromStr for BusAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_uppercase();
        let err = || AddressParseError(s.to_string());

        let mut chars = label.chars();
        let prefix = chars.next().ok_or_else(err)?;
        let index: u8 = chars.as_str().parse().map_err(|_| err())?;

        match prefix {
            'A' | 'B' if index < PINS_PER_PORT => {
                let port = if prefix == 'A' { Port::A } else { Port::B };
                Ok(BusAddress::Input { port, pin: index })
            }
            'K' if (1..=RELAY_COUNT).contains(&index) => Ok(BusAddress::Relay(index)),
            'T' if (1..=TRANSISTOR_COUNT).contains(&index) => Ok(BusAddress::Transistor(index)),
            _ => Err(err()),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Input { port: Port::A, pin } => write!(f, "A{pin}"),
            BusAddress::Input { port: Port::B, pin } => write!(f, "B{pin}"),
            BusAddress::Relay(n) => write!(f, "K{n}"),
            BusAddress::Transistor(n) => write!(f, "T{n}"),
        }
    }
}

impl TryFrom<String> for BusAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(address: BusAddress) -> Self {
        address.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Door,
    Flood,
    Relay,
    Transistor,
}

/// What an output does in the cabinet; the rules address outputs by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRole {
    Alarm,
    Light,
    Cooling,
    Heating,
    EmergencyFan,
    Buzzer,
    Strike,
}

impl OutputRole {
    pub fn is_hvac(self) -> bool {
        matches!(self, OutputRole::Cooling | OutputRole::Heating | OutputRole::EmergencyFan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub address: BusAddress,
    pub kind: ChannelKind,
}

impl Channel {
    pub fn new(name: impl Into<String>, address: BusAddress, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
        }
    }

    /// Output channel whose kind follows from the bank it sits on.
    pub fn output(name: impl Into<String>, address: BusAddress) -> Self {
        let kind = match address {
            BusAddress::Transistor(_) => ChannelKind::Transistor,
            _ => ChannelKind::Relay,
        };
        Self::new(name, address, kind)
    }
}
