//! Published system state and loop health.

use crate::alarms::{AlarmCondition, AlarmKind};
use crate::debounce::InputState;
use crate::outputs::OutputState;
use crate::sensors::SensorReading;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoopPhase {
    /// Outputs at safe defaults, rules not applied yet.
    Warming = 0,
    Running = 1,
    Stopped = 2,
}

impl LoopPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopPhase::Warming,
            1 => LoopPhase::Running,
            _ => LoopPhase::Stopped,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStats {
    pub fast_ticks: u64,
    pub logic_ticks: u64,
    pub sensor_ticks: u64,
    pub missed_ticks: u64,
    pub hardware_errors: u64,
    pub commands_applied: u64,
    pub last_fast_tick_ms: Option<u64>,
    pub last_logic_tick_ms: Option<u64>,
}

/// Immutable view of the whole controller, published as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub sequence: u64,
    pub published_at_ms: u64,
    pub phase: LoopPhase,
    pub inputs: BTreeMap<String, InputState>,
    pub sensors: BTreeMap<String, SensorReading>,
    pub outputs: BTreeMap<String, OutputState>,
    pub manual_mode: bool,
    pub buzzer_muted: bool,
    pub alarms: Vec<AlarmCondition>,
    pub alarm_reason: Option<String>,
    pub control_temperature_c: Option<f32>,
    pub safe_mode: bool,
    /// Counters as of this publication. A quiet cabinet publishes rarely;
    /// [`Health`] carries the live tick and error counts.
    pub stats: LoopStats,
}

impl SystemSnapshot {
    pub fn output(&self, channel: &str) -> Option<&OutputState> {
        self.outputs.get(channel)
    }

    /// True if the named output is on. Unknown channels read as off.
    pub fn is_on(&self, channel: &str) -> bool {
        self.outputs.get(channel).is_some_and(|o| o.active)
    }

    pub fn input(&self, channel: &str) -> Option<&InputState> {
        self.inputs.get(channel)
    }

    pub fn sensor(&self, id: &str) -> Option<&SensorReading> {
        self.sensors.get(id)
    }

    pub fn has_alarm(&self, kind: AlarmKind) -> bool {
        self.alarms.iter().any(|a| a.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub phase: LoopPhase,
    pub healthy: bool,
    pub fast_tick_age_ms: Option<u64>,
    pub logic_tick_age_ms: Option<u64>,
    pub missed_ticks: u64,
    pub fast_ticks: u64,
    pub logic_ticks: u64,
    pub hardware_errors: u64,
}

/// Tick timestamps shared between the loop and its handles, readable
/// without waiting for a snapshot.
#[derive(Debug)]
pub struct Heartbeat {
    phase: AtomicU8,
    last_fast_ms: AtomicU64,
    last_logic_ms: AtomicU64,
    missed: AtomicU64,
    fast_ticks: AtomicU64,
    logic_ticks: AtomicU64,
    hardware_errors: AtomicU64,
}

const NEVER: u64 = 0;

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(LoopPhase::Warming as u8),
            last_fast_ms: AtomicU64::new(NEVER),
            last_logic_ms: AtomicU64::new(NEVER),
            missed: AtomicU64::new(0),
            fast_ticks: AtomicU64::new(0),
            logic_ticks: AtomicU64::new(0),
            hardware_errors: AtomicU64::new(0),
        }
    }

    pub fn set_phase(&self, phase: LoopPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn fast_tick(&self, wall_ms: u64) {
        self.last_fast_ms.store(wall_ms, Ordering::Release);
    }

    pub fn logic_tick(&self, wall_ms: u64) {
        self.last_logic_ms.store(wall_ms, Ordering::Release);
    }

    pub fn missed(&self, count: u64) {
        self.missed.fetch_add(count, Ordering::AcqRel);
    }

    /// Mirror the controller's counters after every tick.
    pub fn record(&self, stats: &LoopStats) {
        self.fast_ticks.store(stats.fast_ticks, Ordering::Release);
        self.logic_ticks.store(stats.logic_ticks, Ordering::Release);
        self.hardware_errors.store(stats.hardware_errors, Ordering::Release);
    }

    /// The loop is healthy while running and both schedules have ticked
    /// within a few periods.
    pub fn health(&self, now_ms: u64, fast_period: Duration, logic_period: Duration) -> Health {
        let age = |stamp: &AtomicU64| match stamp.load(Ordering::Acquire) {
            NEVER => None,
            at => Some(now_ms.saturating_sub(at)),
        };
        let phase = self.phase();
        let fast_tick_age_ms = age(&self.last_fast_ms);
        let logic_tick_age_ms = age(&self.last_logic_ms);

        let fast_limit = fast_period.as_millis() as u64 * 4;
        let logic_limit = logic_period.as_millis() as u64 * 2 + fast_limit;
        let healthy = phase == LoopPhase::Running
            && fast_tick_age_ms.is_some_and(|a| a <= fast_limit)
            && logic_tick_age_ms.is_some_and(|a| a <= logic_limit);

        Health {
            phase,
            healthy,
            fast_tick_age_ms,
            logic_tick_age_ms,
            missed_ticks: self.missed.load(Ordering::Acquire),
            fast_ticks: self.fast_ticks.load(Ordering::Acquire),
            logic_ticks: self.logic_ticks.load(Ordering::Acquire),
            hardware_errors: self.hardware_errors.load(Ordering::Acquire),
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warming_loop_is_not_healthy() {
        let heartbeat = Heartbeat::new();
        let health = heartbeat.health(1_000, Duration::from_millis(250), Duration::from_secs(60));
        assert_eq!(health.phase, LoopPhase::Warming);
        assert!(!health.healthy);
        assert_eq!(health.fast_tick_age_ms, None);
    }

    #[test]
    fn test_running_loop_health_follows_tick_ages() {
        let heartbeat = Heartbeat::new();
        heartbeat.set_phase(LoopPhase::Running);
        heartbeat.fast_tick(10_000);
        heartbeat.logic_tick(9_000);

        let fast = Duration::from_millis(250);
        let logic = Duration::from_secs(60);
        let health = heartbeat.health(10_200, fast, logic);
        assert!(health.healthy);
        assert_eq!(health.fast_tick_age_ms, Some(200));
        assert_eq!(health.logic_tick_age_ms, Some(1_200));

        // Fast schedule stalled for more than four periods.
        assert!(!heartbeat.health(11_500, fast, logic).healthy);
    }

    #[test]
    fn test_missed_ticks_accumulate() {
        let heartbeat = Heartbeat::new();
        heartbeat.missed(2);
        heartbeat.missed(3);
        let health = heartbeat.health(0, Duration::from_millis(250), Duration::from_secs(60));
        assert_eq!(health.missed_ticks, 5);
    }

    #[test]
    fn test_recorded_counters_are_live() {
        let heartbeat = Heartbeat::new();
        let mut stats = LoopStats {
            fast_ticks: 3,
            logic_ticks: 1,
            ..LoopStats::default()
        };
        heartbeat.record(&stats);
        stats.fast_ticks = 4;
        stats.hardware_errors = 2;
        heartbeat.record(&stats);

        let health = heartbeat.health(0, Duration::from_millis(250), Duration::from_secs(60));
        assert_eq!(health.fast_ticks, 4);
        assert_eq!(health.logic_ticks, 1);
        assert_eq!(health.hardware_errors, 2);
    }
}
