//! Controller configuration loaded from TOML.
//!
//! Every field has a default matching the reference cabinet wiring, so an
//! empty file (or [`ControllerConfig::default`]) yields a working setup.

use crate::channel::{BusAddress, OutputRole, Port};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Transistors that may carry a door strike. `T1` drives the 48 V fan bank.
pub const STRIKE_TRANSISTORS: core::ops::RangeInclusive<u8> = 2..=8;

/// Upper bound for `strike.max_duration_ms`: one hour.
pub const STRIKE_DURATION_LIMIT_MS: u64 = 3_600_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("channel name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("bus address {0} is assigned more than once")]
    DuplicateAddress(BusAddress),
    #[error("input `{name}` must use an input address (A0..B7), got {address}")]
    NotAnInput { name: String, address: BusAddress },
    #[error("output `{name}` must use a relay or transistor address, got {address}")]
    NotAnOutput { name: String, address: BusAddress },
    #[error("strike `{name}` must be on transistor T2..T8, got {address}")]
    InvalidStrikeChannel { name: String, address: BusAddress },
    #[error("invalid thresholds: {0}")]
    Thresholds(String),
    #[error("strike default duration {default_ms} ms exceeds maximum {max_ms} ms")]
    StrikeDuration { default_ms: u64, max_ms: u64 },
    #[error("strike maximum duration {max_ms} ms exceeds the {limit_ms} ms limit")]
    StrikeLimit { max_ms: u64, limit_ms: u64 },
    #[error("sensor id `{0}` is configured more than once")]
    DuplicateSensor(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub loops: LoopConfig,
    pub inputs: InputConfig,
    pub outputs: Vec<OutputConfig>,
    pub sensors: Vec<SensorConfig>,
    pub thresholds: Thresholds,
    pub strike: StrikeConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub fast_tick_ms: u64,
    pub logic_tick_ms: u64,
    /// When set, climate sensors are sampled on their own period instead of
    /// at the start of every logic tick.
    pub climate_refresh_ms: Option<u64>,
    pub auxiliary_refresh_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub doors: Vec<InputChannelConfig>,
    pub floods: Vec<InputChannelConfig>,
    pub door_open_is_high: bool,
    pub flood_active_is_low: bool,
    pub debounce_samples: u32,
    pub flood_anti_flap_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelConfig {
    pub name: String,
    pub address: BusAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub address: BusAddress,
    pub role: OutputRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorClass {
    Climate,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    #[serde(default = "default_sensor_class")]
    pub class: SensorClass,
    #[serde(default = "default_true")]
    pub humidity: bool,
    /// Required sensors feed the control temperature; losing one enters safe mode.
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub heating_on_c: f32,
    pub cooling_on_c: f32,
    pub fan_on_c: f32,
    pub hysteresis_c: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrikeConfig {
    pub default_duration_ms: u64,
    pub max_duration_ms: u64,
    pub allow_retrigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub suppress_cooling_on_overheat: bool,
    pub sensor_failure_threshold: u32,
}

fn default_sensor_class() -> SensorClass {
    SensorClass::Climate
}

fn default_true() -> bool {
    true
}

fn input(name: &str, pin: u8) -> InputChannelConfig {
    InputChannelConfig {
        name: name.to_string(),
        address: BusAddress::Input { port: Port::A, pin },
    }
}

fn output(name: &str, address: BusAddress, role: OutputRole) -> OutputConfig {
    OutputConfig {
        name: name.to_string(),
        address,
        role,
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            loops: LoopConfig::default(),
            inputs: InputConfig::default(),
            outputs: vec![
                output("alarm", BusAddress::Relay(1), OutputRole::Alarm),
                output("cooling", BusAddress::Relay(2), OutputRole::Cooling),
                output("light", BusAddress::Relay(3), OutputRole::Light),
                output("heating", BusAddress::Relay(4), OutputRole::Heating),
                output("fan_230v", BusAddress::Relay(5), OutputRole::EmergencyFan),
                output("fan_48v", BusAddress::Transistor(1), OutputRole::EmergencyFan),
                output("strike_1", BusAddress::Transistor(2), OutputRole::Strike),
            ],
            sensors: vec![
                SensorConfig {
                    id: "cabinet".to_string(),
                    class: SensorClass::Climate,
                    humidity: true,
                    required: true,
                },
                SensorConfig {
                    id: "battery".to_string(),
                    class: SensorClass::Climate,
                    humidity: true,
                    required: true,
                },
            ],
            thresholds: Thresholds::default(),
            strike: StrikeConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            fast_tick_ms: 250,
            logic_tick_ms: 60_000,
            climate_refresh_ms: None,
            auxiliary_refresh_ms: 120_000,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            doors: vec![
                input("door_1", 0),
                input("door_2", 1),
                input("door_3", 2),
                input("door_4", 3),
            ],
            floods: vec![input("flood_1", 4)],
            door_open_is_high: true,
            flood_active_is_low: true,
            debounce_samples: 4,
            flood_anti_flap_ms: 3_000,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            heating_on_c: 5.0,
            cooling_on_c: 25.0,
            fan_on_c: 30.0,
            hysteresis_c: 1.0,
        }
    }
}

impl Default for StrikeConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 10_000,
            max_duration_ms: 60_000,
            allow_retrigger: false,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            suppress_cooling_on_overheat: true,
            sensor_failure_threshold: 3,
        }
    }
}

impl LoopConfig {
    pub fn fast_period(&self) -> Duration {
        Duration::from_millis(self.fast_tick_ms)
    }

    pub fn logic_period(&self) -> Duration {
        Duration::from_millis(self.logic_tick_ms)
    }

    pub fn climate_period(&self) -> Option<Duration> {
        self.climate_refresh_ms.map(Duration::from_millis)
    }

    pub fn auxiliary_period(&self) -> Duration {
        Duration::from_millis(self.auxiliary_refresh_ms)
    }
}

impl StrikeConfig {
    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(self.default_duration_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

impl ControllerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("loops.fast_tick_ms", self.loops.fast_tick_ms),
            ("loops.logic_tick_ms", self.loops.logic_tick_ms),
            ("loops.auxiliary_refresh_ms", self.loops.auxiliary_refresh_ms),
            ("loops.climate_refresh_ms", self.loops.climate_refresh_ms.unwrap_or(1)),
            ("inputs.debounce_samples", u64::from(self.inputs.debounce_samples)),
            ("strike.default_duration_ms", self.strike.default_duration_ms),
            ("policy.sensor_failure_threshold", u64::from(self.policy.sensor_failure_threshold)),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }

        let mut names = BTreeSet::new();
        let mut addresses = BTreeSet::new();
        let inputs = self.inputs.doors.iter().chain(&self.inputs.floods);
        for channel in inputs {
            if !channel.address.is_input() {
                return Err(ConfigError::NotAnInput {
                    name: channel.name.clone(),
                    address: channel.address,
                });
            }
            claim(&mut names, &mut addresses, &channel.name, channel.address)?;
        }

        for channel in &self.outputs {
            if !channel.address.is_output() {
                return Err(ConfigError::NotAnOutput {
                    name: channel.name.clone(),
                    address: channel.address,
                });
            }
            if channel.role == OutputRole::Strike {
                let on_strike_bank = matches!(
                    channel.address,
                    BusAddress::Transistor(n) if STRIKE_TRANSISTORS.contains(&n)
                );
                if !on_strike_bank {
                    return Err(ConfigError::InvalidStrikeChannel {
                        name: channel.name.clone(),
                        address: channel.address,
                    });
                }
            }
            claim(&mut names, &mut addresses, &channel.name, channel.address)?;
        }

        let mut sensor_ids = BTreeSet::new();
        for sensor in &self.sensors {
            if !sensor_ids.insert(sensor.id.as_str()) {
                return Err(ConfigError::DuplicateSensor(sensor.id.clone()));
            }
        }

        self.validate_thresholds()?;

        if self.strike.default_duration_ms > self.strike.max_duration_ms {
            return Err(ConfigError::StrikeDuration {
                default_ms: self.strike.default_duration_ms,
                max_ms: self.strike.max_duration_ms,
            });
        }
        if self.strike.max_duration_ms > STRIKE_DURATION_LIMIT_MS {
            return Err(ConfigError::StrikeLimit {
                max_ms: self.strike.max_duration_ms,
                limit_ms: STRIKE_DURATION_LIMIT_MS,
            });
        }

        Ok(())
    }

    fn validate_thresholds(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        let values = [t.heating_on_c, t.cooling_on_c, t.fan_on_c, t.hysteresis_c];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Thresholds("values must be finite".to_string()));
        }
        if t.hysteresis_c < 0.0 {
            return Err(ConfigError::Thresholds("hysteresis must not be negative".to_string()));
        }
        if t.heating_on_c >= t.cooling_on_c {
            return Err(ConfigError::Thresholds(format!(
                "heating_on_c ({}) must be below cooling_on_c ({})",
                t.heating_on_c, t.cooling_on_c
            )));
        }
        if t.cooling_on_c > t.fan_on_c {
            return Err(ConfigError::Thresholds(format!(
                "cooling_on_c ({}) must not exceed fan_on_c ({})",
                t.cooling_on_c, t.fan_on_c
            )));
        }
        Ok(())
    }
}

fn claim<'a>(
    names: &mut BTreeSet<&'a str>,
    addresses: &mut BTreeSet<BusAddress>,
    name: &'a str,
    address: BusAddress,
) -> Result<(), ConfigError> {
    if !names.insert(name) {
        return Err(ConfigError::DuplicateName(name.to_string()));
    }
    if !addresses.insert(address) {
        return Err(ConfigError::DuplicateAddress(address));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.loops.fast_period(), Duration::from_millis(250));
        assert_eq!(config.loops.logic_period(), Duration::from_secs(60));
        assert_eq!(config.inputs.debounce_samples, 4);
        assert_eq!(config.strike.default_duration(), Duration::from_secs(10));
        assert_eq!(config.inputs.doors[3].address.to_string(), "A3");
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let text = r#"
            [loops]
            fast_tick_ms = 100

            [thresholds]
            cooling_on_c = 27.5

            [[outputs]]
            name = "alarm"
            address = "K1"
            role = "alarm"

            [[outputs]]
            name = "buzzer"
            address = "T8"
            role = "buzzer"
        "#;
        let config = ControllerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.loops.fast_tick_ms, 100);
        assert_eq!(config.loops.logic_tick_ms, 60_000);
        assert!((config.thresholds.cooling_on_c - 27.5).abs() < f32::EPSILON);
        assert_eq!(config.outputs.len(), 2);
        assert_eq!(config.outputs[1].address, BusAddress::Transistor(8));
    }

    #[test]
    fn test_rejects_strike_on_relay_or_t1() {
        let mut config = ControllerConfig::default();
        config.outputs.push(output("strike_2", BusAddress::Relay(8), OutputRole::Strike));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStrikeChannel { .. })
        ));

        let mut config = ControllerConfig::default();
        config.outputs.retain(|o| o.name != "fan_48v");
        config.outputs.push(output("strike_2", BusAddress::Transistor(1), OutputRole::Strike));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStrikeChannel { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut config = ControllerConfig::default();
        config.outputs.push(output("alarm", BusAddress::Relay(8), OutputRole::Alarm));
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateName(_))));

        let mut config = ControllerConfig::default();
        config.outputs.push(output("siren", BusAddress::Relay(1), OutputRole::Alarm));
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateAddress(_))));
    }

    #[test]
    fn test_rejects_output_on_input_bank() {
        let mut config = ControllerConfig::default();
        config.outputs.push(output("siren", "B0".parse().unwrap(), OutputRole::Alarm));
        assert!(matches!(config.validate(), Err(ConfigError::NotAnOutput { .. })));
    }

    #[test]
    fn test_rejects_bad_thresholds_and_periods() {
        let mut config = ControllerConfig::default();
        config.thresholds.heating_on_c = 30.0;
        assert!(matches!(config.validate(), Err(ConfigError::Thresholds(_))));

        let mut config = ControllerConfig::default();
        config.loops.fast_tick_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue { field: "loops.fast_tick_ms" })
        ));
    }

    #[test]
    fn test_rejects_unbounded_strike_maximum() {
        let mut config = ControllerConfig::default();
        config.strike.max_duration_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StrikeLimit { max_ms: u64::MAX, .. })
        ));

        config.strike.max_duration_ms = STRIKE_DURATION_LIMIT_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_address_fails_to_parse() {
        let text = r#"
            [[outputs]]
            name = "alarm"
            address = "K12"
            role = "alarm"
        "#;
        assert!(matches!(
            ControllerConfig::from_toml_str(text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = ControllerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ControllerConfig::from_toml_str(&text).unwrap(), config);
    }
}
