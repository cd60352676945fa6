//! The controller: every piece of mutable cabinet state plus the hardware,
//! advanced one tick at a time.
//!
//! [`Controller`] is synchronous and knows nothing about scheduling; the
//! [`crate::control_loop`] actor decides when each tick runs. Tests drive it
//! directly with chosen instants.

use crate::alarms::{AlarmCondition, AlarmTracker};
use crate::channel::ChannelKind;
use crate::commands::{Command, CommandError, Rejection};
use crate::config::{ConfigError, ControllerConfig, SensorClass};
use crate::debounce::{InputDebouncer, InputEdge};
use crate::events::{wall_clock_ms, Event, EventSink, EventType, Severity};
use crate::hardware::{HardwareError, HardwareIo};
use crate::outputs::{OutputChange, OutputDriver, ReconcileReport};
use crate::rules::{ComfortLatch, RuleEngine, RuleInputs};
use crate::sensors::SensorSampler;
use crate::snapshot::{LoopPhase, LoopStats, SystemSnapshot};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("hardware not available: {0}")]
    Hardware(#[from] HardwareError),
    #[error("control loop must be started from within a tokio runtime")]
    NoRuntime,
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

pub struct Controller {
    config: Arc<ControllerConfig>,
    hardware: Box<dyn HardwareIo>,
    sink: Arc<dyn EventSink>,

    debouncer: InputDebouncer,
    sampler: SensorSampler,
    driver: OutputDriver,
    engine: RuleEngine,
    alarms: AlarmTracker,

    latch: ComfortLatch,
    manual_mode: bool,
    buzzer_muted: bool,
    phase: LoopPhase,
    logic_ticked: bool,

    current_alarms: Vec<AlarmCondition>,
    alarm_reason: Option<String>,
    control_temperature: Option<f32>,
    safe_mode: bool,

    stats: LoopStats,
    sequence: u64,
    dirty: bool,
}

impl Controller {
    /// Validate the configuration, check the input bank answers and drive
    /// every output to its safe default. The controller starts `Warming`.
    pub fn new(
        config: ControllerConfig,
        mut hardware: Box<dyn HardwareIo>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        hardware.read_digital_bank()?;

        let mut driver = OutputDriver::new(&config.outputs, config.strike.allow_retrigger);
        let report = driver.initialize(hardware.as_mut());
        for failure in &report.failures {
            error!(error = %failure, "failed to drive output to safe default");
        }

        info!(
            backend = hardware.backend(),
            inputs = config.inputs.doors.len() + config.inputs.floods.len(),
            outputs = config.outputs.len(),
            sensors = config.sensors.len(),
            "controller warming up"
        );

        Ok(Self {
            debouncer: InputDebouncer::new(&config.inputs),
            sampler: SensorSampler::new(&config.sensors, config.policy.sensor_failure_threshold),
            engine: RuleEngine::new(config.thresholds.clone(), &config.policy),
            alarms: AlarmTracker::new(),
            driver,
            latch: ComfortLatch::default(),
            manual_mode: false,
            buzzer_muted: false,
            phase: LoopPhase::Warming,
            logic_ticked: false,
            current_alarms: Vec::new(),
            alarm_reason: None,
            control_temperature: None,
            safe_mode: false,
            stats: LoopStats {
                hardware_errors: report.failures.len() as u64,
                ..LoopStats::default()
            },
            sequence: 0,
            dirty: true,
            config: Arc::new(config),
            hardware,
            sink,
        })
    }

    pub fn config(&self) -> &Arc<ControllerConfig> {
        &self.config
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Debounce inputs, expire strike pulses and react to door or flood
    /// transitions without waiting for the logic tick.
    pub fn fast_tick(&mut self, now: Instant) {
        let wall_ms = wall_clock_ms();
        self.stats.fast_ticks += 1;
        self.stats.last_fast_tick_ms = Some(wall_ms);

        let mut safety_edge = false;
        match self.hardware.read_digital_bank() {
            Ok(bits) => {
                let was_initialized = self.debouncer.is_initialized();
                let edges = self.debouncer.sample(bits, now, wall_ms);
                self.dirty |= !was_initialized && self.debouncer.is_initialized();
                for edge in &edges {
                    log_edge(edge);
                    safety_edge |= matches!(edge.kind, ChannelKind::Door | ChannelKind::Flood);
                }
                self.dirty |= !edges.is_empty();
            }
            Err(e) => {
                warn!(error = %e, "input bank read failed");
                self.stats.hardware_errors += 1;
            }
        }

        let report = self.driver.expire_pulses(now, self.hardware.as_mut());
        for channel in &report.released {
            info!(channel = %channel, "strike released");
            self.sink.emit(
                Event::new(EventType::Strike, Severity::Info, format!("Strike {channel} released"))
                    .with_channel(channel.clone()),
            );
        }
        self.absorb(report);

        let started = self.try_start();
        if started || (safety_edge && self.phase == LoopPhase::Running) {
            self.evaluate();
        }
    }

    /// Leave warm-up once every input has settled and a logic tick has
    /// sampled the sensors.
    fn try_start(&mut self) -> bool {
        if self.phase != LoopPhase::Warming || !self.logic_ticked || !self.debouncer.is_initialized() {
            return false;
        }
        self.phase = LoopPhase::Running;
        self.dirty = true;
        info!("control loop running");
        true
    }

    /// Sample climate sensors (unless they have their own period), leave
    /// warm-up once inputs are known, and apply the rules.
    pub fn logic_tick(&mut self, _now: Instant) {
        let wall_ms = wall_clock_ms();
        self.stats.logic_ticks += 1;
        self.stats.last_logic_tick_ms = Some(wall_ms);

        if self.config.loops.climate_refresh_ms.is_none() {
            self.sample(SensorClass::Climate);
        }

        self.logic_ticked = true;
        self.try_start();
        match self.phase {
            LoopPhase::Running => self.evaluate(),
            LoopPhase::Warming => debug!("inputs still settling, staying in warm-up"),
            LoopPhase::Stopped => {}
        }
    }

    /// Sample one sensor class on its own schedule.
    pub fn sensor_tick(&mut self, class: SensorClass, _now: Instant) {
        if !self.sampler.has_class(class) {
            return;
        }
        self.stats.sensor_ticks += 1;
        self.sample(class);
    }

    fn sample(&mut self, class: SensorClass) {
        let outcome = self.sampler.sample(class, self.hardware.as_mut(), wall_clock_ms());
        self.stats.hardware_errors += outcome.failures.len() as u64;
        self.dirty |= outcome.sampled > 0;
    }

    /// Run the rules over the current state and push the result to the
    /// outputs. One channel's write failure does not stop the others.
    fn evaluate(&mut self) {
        let open_doors = self.debouncer.active(ChannelKind::Door);
        let floods = self.debouncer.active(ChannelKind::Flood);
        let roles = self.driver.roles();
        let overrides = self.driver.manual_overrides();
        let automatic = self.driver.automatic_values();

        let evaluation = self.engine.evaluate(&RuleInputs {
            open_doors: &open_doors,
            floods: &floods,
            sensors: self.sampler.readings(),
            outputs: &roles,
            manual_overrides: &overrides,
            automatic: &automatic,
            manual_mode: self.manual_mode,
            buzzer_muted: self.buzzer_muted,
            latch: self.latch,
        });
        self.latch = evaluation.latch;

        for (channel, decision) in &evaluation.decisions {
            match self
                .driver
                .apply_rule(channel, decision.automatic, decision.safety, self.hardware.as_mut())
            {
                Ok(Some(change)) => {
                    log_change(&change);
                    self.dirty = true;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(channel = %channel, error = %e, "output write failed");
                    self.stats.hardware_errors += 1;
                }
            }
        }

        for edge in self.alarms.update(&evaluation.alarms) {
            self.sink.emit(edge.to_event());
            self.dirty = true;
        }

        let reason = evaluation.reason();
        if reason != self.alarm_reason
            || evaluation.control_temperature != self.control_temperature
            || evaluation.safe_mode != self.safe_mode
        {
            self.dirty = true;
        }
        if evaluation.safe_mode && !self.safe_mode {
            warn!("required sensor data missing, heating and cooling held off");
        }
        self.alarm_reason = reason;
        self.control_temperature = evaluation.control_temperature;
        self.safe_mode = evaluation.safe_mode;
        self.current_alarms = evaluation.alarms;
    }

    fn absorb(&mut self, report: ReconcileReport) {
        for change in &report.changes {
            log_change(change);
        }
        for failure in &report.failures {
            error!(error = %failure, "output write failed");
        }
        self.stats.hardware_errors += report.failures.len() as u64;
        self.dirty |= !report.changes.is_empty();
    }

    /// Apply one operator command. Called at the start of a fast tick.
    pub fn apply_command(&mut self, command: Command, now: Instant) -> Result<(), CommandError> {
        match command {
            Command::SetManual { channel, desired } => {
                if self.driver.is_safety_held(&channel) {
                    return Err(Rejection::SafetyInterlock(channel).into());
                }
                let change = self.driver.set_manual(&channel, desired, self.hardware.as_mut())?;
                if let Some(change) = change {
                    log_change(&change);
                }
                let message = match desired {
                    Some(value) => format!("Manual override {channel} -> {}", on_off(value)),
                    None => format!("Manual override {channel} cleared"),
                };
                self.sink
                    .emit(Event::new(EventType::Manual, Severity::Info, message).with_channel(channel));
            }
            Command::TriggerStrike { channel, duration } => {
                let record = self
                    .driver
                    .pulse(&channel, duration, now, wall_clock_ms(), self.hardware.as_mut())?;
                info!(channel = %channel, duration_ms = record.duration_ms, "strike energized");
                self.sink.emit(
                    Event::new(
                        EventType::Strike,
                        Severity::Info,
                        format!("Strike {channel} energized for {} ms", record.duration_ms),
                    )
                    .with_channel(channel),
                );
            }
            Command::SetManualMode { enabled } => {
                if self.manual_mode != enabled {
                    self.manual_mode = enabled;
                    let message = if enabled { "Manual mode enabled" } else { "Manual mode disabled" };
                    info!("{message}");
                    self.sink.emit(Event::new(EventType::Manual, Severity::Warning, message));
                    if self.phase == LoopPhase::Running {
                        self.evaluate();
                    }
                }
            }
            Command::SetBuzzerMuted { muted } => {
                if self.buzzer_muted != muted {
                    self.buzzer_muted = muted;
                    let message = if muted { "Buzzer muted" } else { "Buzzer unmuted" };
                    self.sink.emit(Event::new(EventType::Manual, Severity::Info, message));
                    if self.phase == LoopPhase::Running {
                        self.evaluate();
                    }
                }
            }
        }
        self.stats.commands_applied += 1;
        self.dirty = true;
        Ok(())
    }

    pub fn record_missed_ticks(&mut self, count: u64) {
        self.stats.missed_ticks += count;
        self.dirty = true;
    }

    /// True if anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Build the next snapshot. Each call takes a new sequence number.
    pub fn snapshot(&mut self) -> SystemSnapshot {
        self.sequence += 1;
        SystemSnapshot {
            sequence: self.sequence,
            published_at_ms: wall_clock_ms(),
            phase: self.phase,
            inputs: self.debouncer.states(),
            sensors: self.sampler.readings().clone(),
            outputs: self.driver.states(),
            manual_mode: self.manual_mode,
            buzzer_muted: self.buzzer_muted,
            alarms: self.current_alarms.clone(),
            alarm_reason: self.alarm_reason.clone(),
            control_temperature_c: self.control_temperature,
            safe_mode: self.safe_mode,
            stats: self.stats.clone(),
        }
    }

    /// Stop: outputs stay as last commanded and the bus is released.
    pub fn shutdown(&mut self) {
        if self.phase == LoopPhase::Stopped {
            return;
        }
        self.phase = LoopPhase::Stopped;
        self.hardware.release();
        self.dirty = true;
        info!("controller stopped");
    }
}

fn log_edge(edge: &InputEdge) {
    debug!(channel = %edge.channel, kind = ?edge.kind, active = edge.active, "input changed");
}

fn log_change(change: &OutputChange) {
    info!(
        channel = %change.channel,
        state = on_off(change.active),
        source = ?change.source,
        "output changed"
    );
}
