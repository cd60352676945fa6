//! Climate sensor sampling with consecutive-failure tracking.

use crate::config::{SensorClass, SensorConfig};
use crate::hardware::{HardwareError, HardwareIo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    /// Not read yet.
    Pending,
    Available,
    /// Failed `failure_threshold` reads in a row.
    Unavailable,
}

/// Latest known state of one sensor. Values survive an outage for display
/// but are never handed to the rules unless the sensor is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor: String,
    pub class: SensorClass,
    pub required: bool,
    pub temperature_c: Option<f32>,
    pub humidity_pct: Option<f32>,
    pub status: SensorStatus,
    pub last_success_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl SensorReading {
    fn pending(config: &SensorConfig) -> Self {
        Self {
            sensor: config.id.clone(),
            class: config.class,
            required: config.required,
            temperature_c: None,
            humidity_pct: None,
            status: SensorStatus::Pending,
            last_success_ms: None,
            consecutive_failures: 0,
        }
    }

    /// Temperature the rules may act on.
    pub fn usable_temperature(&self) -> Option<f32> {
        match self.status {
            SensorStatus::Available => self.temperature_c,
            SensorStatus::Pending | SensorStatus::Unavailable => None,
        }
    }
}

/// Status transitions produced by one sampling pass.
#[derive(Debug, Default)]
pub struct SampleOutcome {
    pub sampled: usize,
    pub became_unavailable: Vec<String>,
    pub recovered: Vec<String>,
    pub failures: Vec<(String, HardwareError)>,
}

impl SampleOutcome {
    pub fn changed_status(&self) -> bool {
        !self.became_unavailable.is_empty() || !self.recovered.is_empty()
    }
}

#[derive(Debug)]
pub struct SensorSampler {
    configs: Vec<SensorConfig>,
    readings: BTreeMap<String, SensorReading>,
    failure_threshold: u32,
}

impl SensorSampler {
    pub fn new(sensors: &[SensorConfig], failure_threshold: u32) -> Self {
        let readings = sensors
            .iter()
            .map(|s| (s.id.clone(), SensorReading::pending(s)))
            .collect();
        Self {
            configs: sensors.to_vec(),
            readings,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Read every sensor of `class`. Failures are counted, never raised.
    pub fn sample(&mut self, class: SensorClass, hardware: &mut dyn HardwareIo, wall_ms: u64) -> SampleOutcome {
        let mut outcome = SampleOutcome::default();
        let ids: Vec<(String, bool)> = self
            .configs
            .iter()
            .filter(|c| c.class == class)
            .map(|c| (c.id.clone(), c.humidity))
            .collect();

        for (id, wants_humidity) in ids {
            outcome.sampled += 1;
            match hardware.read_temperature(&id) {
                Ok(celsius) => {
                    let humidity = if wants_humidity {
                        hardware
                            .read_humidity(&id)
                            .map_err(|e| debug!(sensor = %id, error = %e, "humidity read failed"))
                            .ok()
                    } else {
                        None
                    };
                    if self.record_success(&id, celsius, humidity, wall_ms) {
                        info!(sensor = %id, celsius, "sensor recovered");
                        outcome.recovered.push(id);
                    }
                }
                Err(error) => {
                    warn!(sensor = %id, error = %error, "sensor read failed");
                    if self.record_failure(&id) {
                        warn!(sensor = %id, failures = self.failure_threshold, "sensor unavailable");
                        outcome.became_unavailable.push(id.clone());
                    }
                    outcome.failures.push((id, error));
                }
            }
        }
        outcome
    }

    /// Store a good read. Returns true if the sensor was unavailable.
    pub fn record_success(&mut self, id: &str, celsius: f32, humidity: Option<f32>, wall_ms: u64) -> bool {
        let Some(reading) = self.readings.get_mut(id) else {
            return false;
        };
        let recovered = reading.status == SensorStatus::Unavailable;
        reading.temperature_c = Some(celsius);
        if humidity.is_some() {
            reading.humidity_pct = humidity;
        }
        reading.status = SensorStatus::Available;
        reading.last_success_ms = Some(wall_ms);
        reading.consecutive_failures = 0;
        recovered
    }

    /// Count a failed read. Returns true on the transition to unavailable.
    pub fn record_failure(&mut self, id: &str) -> bool {
        let Some(reading) = self.readings.get_mut(id) else {
            return false;
        };
        reading.consecutive_failures = reading.consecutive_failures.saturating_add(1);
        if reading.consecutive_failures >= self.failure_threshold && reading.status != SensorStatus::Unavailable {
            reading.status = SensorStatus::Unavailable;
            return true;
        }
        false
    }

    pub fn readings(&self) -> &BTreeMap<String, SensorReading> {
        &self.readings
    }

    pub fn reading(&self, id: &str) -> Option<&SensorReading> {
        self.readings.get(id)
    }

    pub fn has_class(&self, class: SensorClass) -> bool {
        self.configs.iter().any(|c| c.class == class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulator::SimulatedHardware;

    fn climate(id: &str) -> SensorConfig {
        SensorConfig {
            id: id.to_string(),
            class: SensorClass::Climate,
            humidity: true,
            required: true,
        }
    }

    #[test]
    fn test_pending_until_first_read() {
        let sampler = SensorSampler::new(&[climate("cabinet")], 3);
        let reading = sampler.reading("cabinet").unwrap();
        assert_eq!(reading.status, SensorStatus::Pending);
        assert_eq!(reading.usable_temperature(), None);
    }

    #[test]
    fn test_successful_sample_stores_values() {
        let (mut hw, sim) = SimulatedHardware::with_sensors(["cabinet"]);
        sim.set_temperature("cabinet", 22.5);
        sim.set_humidity("cabinet", 51.0);
        let mut sampler = SensorSampler::new(&[climate("cabinet")], 3);

        let outcome = sampler.sample(SensorClass::Climate, &mut hw, 1_000);
        assert_eq!(outcome.sampled, 1);
        assert!(outcome.failures.is_empty());

        let reading = sampler.reading("cabinet").unwrap();
        assert_eq!(reading.status, SensorStatus::Available);
        assert_eq!(reading.usable_temperature(), Some(22.5));
        assert_eq!(reading.humidity_pct, Some(51.0));
        assert_eq!(reading.last_success_ms, Some(1_000));
    }

    #[test]
    fn test_threshold_then_recovery() {
        let (mut hw, sim) = SimulatedHardware::with_sensors(["cabinet"]);
        let mut sampler = SensorSampler::new(&[climate("cabinet")], 3);
        sampler.sample(SensorClass::Climate, &mut hw, 0);

        sim.fail_sensor("cabinet", true);
        for _ in 0..2 {
            let outcome = sampler.sample(SensorClass::Climate, &mut hw, 0);
            assert!(outcome.became_unavailable.is_empty());
            assert_eq!(sampler.reading("cabinet").unwrap().status, SensorStatus::Available);
        }
        let outcome = sampler.sample(SensorClass::Climate, &mut hw, 0);
        assert_eq!(outcome.became_unavailable, vec!["cabinet".to_string()]);

        let reading = sampler.reading("cabinet").unwrap();
        assert_eq!(reading.status, SensorStatus::Unavailable);
        assert_eq!(reading.usable_temperature(), None);
        assert_eq!(reading.temperature_c, Some(20.0), "last value kept for display");

        // Further failures do not re-announce.
        assert!(sampler.sample(SensorClass::Climate, &mut hw, 0).became_unavailable.is_empty());

        sim.fail_sensor("cabinet", false);
        let outcome = sampler.sample(SensorClass::Climate, &mut hw, 0);
        assert_eq!(outcome.recovered, vec!["cabinet".to_string()]);
        assert_eq!(sampler.reading("cabinet").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_samples_only_requested_class() {
        let (mut hw, _sim) = SimulatedHardware::with_sensors(["cabinet", "rack"]);
        let aux = SensorConfig {
            class: SensorClass::Auxiliary,
            ..climate("rack")
        };
        let mut sampler = SensorSampler::new(&[climate("cabinet"), aux], 3);
        let outcome = sampler.sample(SensorClass::Auxiliary, &mut hw, 0);
        assert_eq!(outcome.sampled, 1);
        assert_eq!(sampler.reading("cabinet").unwrap().status, SensorStatus::Pending);
        assert_eq!(sampler.reading("rack").unwrap().status, SensorStatus::Available);
    }

    #[test]
    fn test_missing_humidity_is_not_a_failure() {
        let (mut hw, sim) = SimulatedHardware::new();
        sim.set_temperature("probe", 12.0);
        let mut sampler = SensorSampler::new(&[climate("probe")], 1);
        let outcome = sampler.sample(SensorClass::Climate, &mut hw, 0);
        assert!(outcome.failures.is_empty());
        let reading = sampler.reading("probe").unwrap();
        assert_eq!(reading.status, SensorStatus::Available);
        assert_eq!(reading.humidity_pct, None);
    }
}
