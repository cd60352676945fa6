//! Fixed-priority cabinet policy.
//!
//! Rules, highest priority first:
//!
//! 1. Door open: HVAC and emergency fans off, alarm and light on.
//! 2. Flood: alarm on.
//! 3. Overheat: emergency fans and alarm on, optionally cooling off.
//! 4. Comfort: cooling and heating with hysteresis.
//! 5. Sensor fault: heating and cooling off while a required sensor is out.
//!
//! Rule 5 only replaces rule 4. Manual overrides replace rule values except
//! where rule 1 or 2 claims the output. Global manual mode skips rules 3-5
//! and keeps each output's last automatic value.
//! Evaluation is a pure function of [`RuleInputs`].

use crate::alarms::{alarm_reason, AlarmCondition, AlarmKind};
use crate::channel::OutputRole;
use crate::config::{PolicyConfig, Thresholds};
use crate::events::Severity;
use crate::sensors::{SensorReading, SensorStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuleId {
    DoorOpen,
    Flood,
    Overheat,
    Comfort,
    SensorFault,
}

impl RuleId {
    /// Safety rules hold their outputs against manual overrides.
    pub fn is_safety(self) -> bool {
        matches!(self, RuleId::DoorOpen | RuleId::Flood)
    }
}

/// Hysteresis memory carried between evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComfortLatch {
    pub cooling: bool,
    pub heating: bool,
    pub fans: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RuleInputs<'a> {
    pub open_doors: &'a [String],
    pub floods: &'a [String],
    pub sensors: &'a BTreeMap<String, SensorReading>,
    pub outputs: &'a BTreeMap<String, OutputRole>,
    pub manual_overrides: &'a BTreeMap<String, bool>,
    /// Automatic value each output holds now, kept in manual mode.
    pub automatic: &'a BTreeMap<String, bool>,
    pub manual_mode: bool,
    pub buzzer_muted: bool,
    pub latch: ComfortLatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    Default,
    Rule(RuleId),
    Manual,
    /// Kept from before global manual mode.
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Value the rules want, ignoring overrides.
    pub automatic: bool,
    /// Set when a safety rule holds the output.
    pub safety: Option<bool>,
    /// Effective value after manual overrides.
    pub value: bool,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decisions: BTreeMap<String, Decision>,
    pub alarms: Vec<AlarmCondition>,
    pub latch: ComfortLatch,
    pub control_temperature: Option<f32>,
    pub safe_mode: bool,
}

impl Evaluation {
    pub fn value(&self, channel: &str) -> Option<bool> {
        self.decisions.get(channel).map(|d| d.value)
    }

    pub fn has_alarm(&self, kind: AlarmKind) -> bool {
        self.alarms.iter().any(|a| a.kind == kind)
    }

    pub fn reason(&self) -> Option<String> {
        alarm_reason(&self.alarms)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    on: bool,
    rule: Option<RuleId>,
}

impl Slot {
    fn set(&mut self, on: bool, rule: RuleId) {
        self.on = on;
        self.rule = Some(rule);
    }
}

#[derive(Debug, Default)]
struct RolePlan {
    alarm: Slot,
    light: Slot,
    cooling: Slot,
    heating: Slot,
    fans: Slot,
}

fn hysteresis(current: bool, switch_on: bool, switch_off: bool) -> bool {
    if switch_on {
        true
    } else if switch_off {
        false
    } else {
        current
    }
}

#[derive(Debug, Clone)]
pub struct RuleEngine {
    thresholds: Thresholds,
    suppress_cooling_on_overheat: bool,
}

impl RuleEngine {
    pub fn new(thresholds: Thresholds, policy: &PolicyConfig) -> Self {
        Self {
            thresholds,
            suppress_cooling_on_overheat: policy.suppress_cooling_on_overheat,
        }
    }

    pub fn evaluate(&self, inputs: &RuleInputs<'_>) -> Evaluation {
        let mut plan = RolePlan::default();
        let mut alarms = Vec::new();
        let mut latch = inputs.latch;

        let required: Vec<&SensorReading> = inputs.sensors.values().filter(|s| s.required).collect();
        let control_temperature = required
            .iter()
            .filter_map(|s| s.usable_temperature())
            .reduce(f32::max);
        let safe_mode = required.iter().any(|s| s.status == SensorStatus::Unavailable)
            || (!required.is_empty() && control_temperature.is_none());

        for sensor in inputs.sensors.values() {
            if sensor.status == SensorStatus::Unavailable {
                let severity = if sensor.required { Severity::Critical } else { Severity::Warning };
                alarms.push(
                    AlarmCondition::new(
                        AlarmKind::SensorFault,
                        severity,
                        format!("Sensor {} unavailable", sensor.sensor),
                    )
                    .on(sensor.sensor.clone()),
                );
            }
        }

        if !inputs.manual_mode {
            self.apply_climate_rules(&mut plan, &mut latch, &mut alarms, control_temperature, safe_mode);
        }

        // Rule 2
        for channel in inputs.floods {
            alarms.push(
                AlarmCondition::new(AlarmKind::FloodDetected, Severity::Critical, "Flood detected").on(channel.clone()),
            );
        }
        if !inputs.floods.is_empty() {
            plan.alarm.set(true, RuleId::Flood);
        }

        // Rule 1
        for channel in inputs.open_doors {
            alarms.push(AlarmCondition::new(AlarmKind::DoorOpen, Severity::Warning, "Door open").on(channel.clone()));
        }
        if !inputs.open_doors.is_empty() {
            plan.cooling.set(false, RuleId::DoorOpen);
            plan.heating.set(false, RuleId::DoorOpen);
            plan.fans.set(false, RuleId::DoorOpen);
            plan.alarm.set(true, RuleId::DoorOpen);
            plan.light.set(true, RuleId::DoorOpen);
        }

        let decisions = inputs
            .outputs
            .iter()
            .filter_map(|(name, role)| {
                let muted = *role == OutputRole::Buzzer && inputs.buzzer_muted;
                let slot = match role {
                    OutputRole::Alarm => plan.alarm,
                    OutputRole::Light => plan.light,
                    OutputRole::Cooling => plan.cooling,
                    OutputRole::Heating => plan.heating,
                    OutputRole::EmergencyFan => plan.fans,
                    OutputRole::Buzzer if muted => Slot::default(),
                    OutputRole::Buzzer => plan.alarm,
                    OutputRole::Strike => return None,
                };
                let manual = inputs.manual_overrides.get(name).copied();
                let held = (inputs.manual_mode && !muted)
                    .then(|| inputs.automatic.get(name).copied().unwrap_or(false));
                Some((name.clone(), decide(slot, manual, held)))
            })
            .collect();

        Evaluation {
            decisions,
            alarms,
            latch,
            control_temperature,
            safe_mode,
        }
    }

    /// Rules 3 to 5, applied lowest priority first.
    fn apply_climate_rules(
        &self,
        plan: &mut RolePlan,
        latch: &mut ComfortLatch,
        alarms: &mut Vec<AlarmCondition>,
        control_temperature: Option<f32>,
        safe_mode: bool,
    ) {
        let t = &self.thresholds;

        match control_temperature {
            Some(temp) if !safe_mode => {
                latch.cooling = hysteresis(
                    latch.cooling,
                    temp >= t.cooling_on_c,
                    temp <= t.cooling_on_c - t.hysteresis_c,
                );
                latch.heating = hysteresis(
                    latch.heating,
                    temp <= t.heating_on_c,
                    temp >= t.heating_on_c + t.hysteresis_c,
                );
                plan.cooling.set(latch.cooling, RuleId::Comfort);
                plan.heating.set(latch.heating, RuleId::Comfort);
            }
            _ => {
                latch.cooling = false;
                latch.heating = false;
                if safe_mode {
                    plan.cooling.set(false, RuleId::SensorFault);
                    plan.heating.set(false, RuleId::SensorFault);
                }
            }
        }

        let Some(temp) = control_temperature else {
            latch.fans = false;
            return;
        };
        latch.fans = hysteresis(latch.fans, temp >= t.fan_on_c, temp <= t.fan_on_c - t.hysteresis_c);
        if latch.fans {
            plan.fans.set(true, RuleId::Overheat);
            plan.alarm.set(true, RuleId::Overheat);
            if self.suppress_cooling_on_overheat {
                plan.cooling.set(false, RuleId::Overheat);
            }
            alarms.push(AlarmCondition::new(
                AlarmKind::Overheat,
                Severity::Critical,
                format!("Overtemperature {temp:.1} C"),
            ));
        }
    }
}

/// `held` replaces the rule value below the safety layer.
fn decide(slot: Slot, manual: Option<bool>, held: Option<bool>) -> Decision {
    let safety = slot.rule.filter(|r| r.is_safety()).map(|_| slot.on);
    let automatic = held.unwrap_or(slot.on);
    let (value, source) = match (safety, manual, slot.rule) {
        (Some(value), _, Some(rule)) => (value, DecisionSource::Rule(rule)),
        (None, Some(value), _) => (value, DecisionSource::Manual),
        _ if held.is_some() => (automatic, DecisionSource::Held),
        (_, _, Some(rule)) => (slot.on, DecisionSource::Rule(rule)),
        (_, _, None) => (slot.on, DecisionSource::Default),
    };
    Decision {
        automatic,
        safety,
        value,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorClass;

    fn reading(id: &str, temp: f32) -> SensorReading {
        SensorReading {
            sensor: id.to_string(),
            class: SensorClass::Climate,
            required: true,
            temperature_c: Some(temp),
            humidity_pct: None,
            status: SensorStatus::Available,
            last_success_ms: Some(0),
            consecutive_failures: 0,
        }
    }

    #[test]
    fn test_hysteresis_helper() {
        assert!(hysteresis(false, true, false));
        assert!(!hysteresis(true, false, true));
        assert!(hysteresis(true, false, false));
        assert!(!hysteresis(false, false, false));
    }

    #[test]
    fn test_decide_safety_beats_manual() {
        let mut slot = Slot::default();
        slot.set(false, RuleId::DoorOpen);
        let decision = decide(slot, Some(true), None);
        assert_eq!(decision.safety, Some(false));
        assert!(!decision.value);
        assert_eq!(decision.source, DecisionSource::Rule(RuleId::DoorOpen));

        slot.set(true, RuleId::Comfort);
        let decision = decide(slot, Some(false), None);
        assert_eq!(decision.safety, None);
        assert!(!decision.value);
        assert_eq!(decision.source, DecisionSource::Manual);
    }

    #[test]
    fn test_decide_held_value_sits_below_safety_and_manual() {
        let mut slot = Slot::default();
        let decision = decide(slot, None, Some(true));
        assert!(decision.automatic);
        assert!(decision.value);
        assert_eq!(decision.source, DecisionSource::Held);

        assert_eq!(decide(slot, Some(false), Some(true)).source, DecisionSource::Manual);

        // A door keeps the held value in the automatic layer for later
        slot.set(false, RuleId::DoorOpen);
        let decision = decide(slot, None, Some(true));
        assert_eq!(decision.safety, Some(false));
        assert!(decision.automatic);
        assert!(!decision.value);
    }

    #[test]
    fn test_control_temperature_is_max_of_required() {
        let engine = RuleEngine::new(Thresholds::default(), &PolicyConfig::default());
        let mut sensors = BTreeMap::new();
        sensors.insert("cabinet".to_string(), reading("cabinet", 21.0));
        sensors.insert("battery".to_string(), reading("battery", 23.5));
        let mut optional = reading("outside", 40.0);
        optional.required = false;
        sensors.insert("outside".to_string(), optional);

        let outputs = BTreeMap::new();
        let overrides = BTreeMap::new();
        let evaluation = engine.evaluate(&RuleInputs {
            open_doors: &[],
            floods: &[],
            sensors: &sensors,
            outputs: &outputs,
            manual_overrides: &overrides,
            automatic: &overrides,
            manual_mode: false,
            buzzer_muted: false,
            latch: ComfortLatch::default(),
        });
        assert_eq!(evaluation.control_temperature, Some(23.5));
        assert!(!evaluation.safe_mode);
    }
}
