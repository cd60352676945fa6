//! Output precedence, hardware writes and strike pulses.
//!
//! Every output keeps four layers of intent. The effective value is taken
//! from the first layer that is set: live pulse, safety hold, manual
//! override, automatic rule value. A change is only committed once the
//! hardware write succeeds.

use crate::channel::{BusAddress, Channel, OutputRole};
use crate::config::OutputConfig;
use crate::hardware::{write_output, HardwareError, HardwareIo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationSource {
    Startup,
    Automatic,
    Safety,
    Manual,
    Pulse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRecord {
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub role: OutputRole,
    pub address: BusAddress,
    pub active: bool,
    pub source: ActivationSource,
    /// Value held by the door or flood rule, if any.
    pub safety: Option<bool>,
    pub manual: Option<bool>,
    pub pulse: Option<PulseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("unknown output channel `{0}`")]
    UnknownChannel(String),
    #[error("channel `{0}` does not accept manual overrides")]
    NotManualCapable(String),
    #[error("channel `{0}` is not a strike output")]
    NotStrikeCapable(String),
    #[error("strike `{0}` is already pulsing")]
    AlreadyPulsing(String),
    #[error("pulse duration is zero or out of range")]
    InvalidDuration,
    #[error("write to `{channel}` failed: {source}")]
    Write {
        channel: String,
        #[source]
        source: HardwareError,
    },
}

/// A committed hardware change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChange {
    pub channel: String,
    pub active: bool,
    pub source: ActivationSource,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub changes: Vec<OutputChange>,
    pub failures: Vec<OutputError>,
    /// Strike channels whose pulse ended and whose release write succeeded.
    pub released: Vec<String>,
}

#[derive(Debug, Clone)]
struct ActivePulse {
    record: PulseRecord,
    deadline: Instant,
}

#[derive(Debug)]
struct Line {
    channel: Channel,
    role: OutputRole,
    automatic: bool,
    safety: Option<bool>,
    manual: Option<bool>,
    pulse: Option<ActivePulse>,
    active: bool,
    source: ActivationSource,
    /// Hardware level confirmed by a successful write.
    confirmed: bool,
    release_pending: bool,
}

type Intent = (bool, Option<bool>, Option<bool>, Option<ActivePulse>);

impl Line {
    fn desired(&self) -> (bool, ActivationSource) {
        if self.pulse.is_some() {
            (true, ActivationSource::Pulse)
        } else if let Some(value) = self.safety {
            (value, ActivationSource::Safety)
        } else if let Some(value) = self.manual {
            (value, ActivationSource::Manual)
        } else {
            (self.automatic, ActivationSource::Automatic)
        }
    }

    fn intent(&self) -> Intent {
        (self.automatic, self.safety, self.manual, self.pulse.clone())
    }

    fn restore(&mut self, intent: Intent) {
        (self.automatic, self.safety, self.manual, self.pulse) = intent;
    }

    fn drive(&mut self, hardware: &mut dyn HardwareIo) -> Result<Option<OutputChange>, OutputError> {
        let (value, source) = self.desired();
        if self.confirmed && value == self.active {
            self.source = source;
            return Ok(None);
        }
        write_output(hardware, self.channel.address, value).map_err(|source| OutputError::Write {
            channel: self.channel.name.clone(),
            source,
        })?;
        self.confirmed = true;
        self.active = value;
        self.source = source;
        Ok(Some(OutputChange {
            channel: self.channel.name.clone(),
            active: value,
            source,
        }))
    }

    fn state(&self) -> OutputState {
        OutputState {
            role: self.role,
            address: self.channel.address,
            active: self.active,
            source: self.source,
            safety: self.safety,
            manual: self.manual,
            pulse: self.pulse.as_ref().map(|p| p.record.clone()),
        }
    }
}

#[derive(Debug)]
pub struct OutputDriver {
    lines: Vec<Line>,
    allow_retrigger: bool,
}

impl OutputDriver {
    pub fn new(outputs: &[OutputConfig], allow_retrigger: bool) -> Self {
        let lines = outputs
            .iter()
            .map(|o| Line {
                channel: Channel::output(o.name.clone(), o.address),
                role: o.role,
                automatic: false,
                safety: None,
                manual: None,
                pulse: None,
                active: false,
                source: ActivationSource::Startup,
                confirmed: false,
                release_pending: false,
            })
            .collect();
        Self {
            lines,
            allow_retrigger,
        }
    }

    fn line_mut(&mut self, channel: &str) -> Result<&mut Line, OutputError> {
        self.lines
            .iter_mut()
            .find(|l| l.channel.name == channel)
            .ok_or_else(|| OutputError::UnknownChannel(channel.to_string()))
    }

    /// Apply an intent change and write it; on failure the intent reverts.
    fn update(
        &mut self,
        channel: &str,
        hardware: &mut dyn HardwareIo,
        change: impl FnOnce(&mut Line),
    ) -> Result<Option<OutputChange>, OutputError> {
        let line = self.line_mut(channel)?;
        let saved = line.intent();
        change(line);
        line.drive(hardware).inspect_err(|_| line.restore(saved))
    }

    /// Drive every output off, regardless of what the board holds.
    pub fn initialize(&mut self, hardware: &mut dyn HardwareIo) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for line in &mut self.lines {
            match write_output(hardware, line.channel.address, false) {
                Ok(()) => line.confirmed = true,
                Err(source) => report.failures.push(OutputError::Write {
                    channel: line.channel.name.clone(),
                    source,
                }),
            }
        }
        report
    }

    pub fn set_automatic(
        &mut self,
        channel: &str,
        value: bool,
        hardware: &mut dyn HardwareIo,
    ) -> Result<Option<OutputChange>, OutputError> {
        self.update(channel, hardware, |line| line.automatic = value)
    }

    pub fn set_safety(
        &mut self,
        channel: &str,
        value: Option<bool>,
        hardware: &mut dyn HardwareIo,
    ) -> Result<Option<OutputChange>, OutputError> {
        self.update(channel, hardware, |line| line.safety = value)
    }

    /// Set both rule layers with a single write.
    pub fn apply_rule(
        &mut self,
        channel: &str,
        automatic: bool,
        safety: Option<bool>,
        hardware: &mut dyn HardwareIo,
    ) -> Result<Option<OutputChange>, OutputError> {
        self.update(channel, hardware, |line| {
            line.automatic = automatic;
            line.safety = safety;
        })
    }

    pub fn set_manual(
        &mut self,
        channel: &str,
        value: Option<bool>,
        hardware: &mut dyn HardwareIo,
    ) -> Result<Option<OutputChange>, OutputError> {
        if self.line_mut(channel)?.role == OutputRole::Strike {
            return Err(OutputError::NotManualCapable(channel.to_string()));
        }
        self.update(channel, hardware, |line| line.manual = value)
    }

    /// Energize a strike for `duration`. With retrigger allowed, a second
    /// pulse extends the running one.
    pub fn pulse(
        &mut self,
        channel: &str,
        duration: Duration,
        now: Instant,
        wall_ms: u64,
        hardware: &mut dyn HardwareIo,
    ) -> Result<PulseRecord, OutputError> {
        let allow_retrigger = self.allow_retrigger;
        let line = self.line_mut(channel)?;
        if line.role != OutputRole::Strike {
            return Err(OutputError::NotStrikeCapable(channel.to_string()));
        }
        if duration.is_zero() {
            return Err(OutputError::InvalidDuration);
        }
        let duration_ms = u64::try_from(duration.as_millis()).map_err(|_| OutputError::InvalidDuration)?;
        let deadline = now.checked_add(duration).ok_or(OutputError::InvalidDuration)?;
        let expires_at_ms = wall_ms.checked_add(duration_ms).ok_or(OutputError::InvalidDuration)?;

        let pulse = match &line.pulse {
            Some(_) if !allow_retrigger => {
                return Err(OutputError::AlreadyPulsing(channel.to_string()));
            }
            Some(running) => ActivePulse {
                record: PulseRecord {
                    started_at_ms: running.record.started_at_ms,
                    duration_ms: expires_at_ms.saturating_sub(running.record.started_at_ms),
                    expires_at_ms,
                },
                deadline,
            },
            None => ActivePulse {
                record: PulseRecord {
                    started_at_ms: wall_ms,
                    duration_ms,
                    expires_at_ms,
                },
                deadline,
            },
        };

        let record = pulse.record.clone();
        self.update(channel, hardware, |line| {
            line.pulse = Some(pulse);
            line.release_pending = false;
        })?;
        Ok(record)
    }

    /// End pulses whose deadline has passed and drive those strikes back to
    /// their baseline. A failed release write is retried on the next call.
    pub fn expire_pulses(&mut self, now: Instant, hardware: &mut dyn HardwareIo) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for line in &mut self.lines {
            if line.pulse.as_ref().is_some_and(|p| now >= p.deadline) {
                line.pulse = None;
                line.release_pending = true;
            }
            if !line.release_pending {
                continue;
            }
            match line.drive(hardware) {
                Ok(change) => {
                    line.release_pending = false;
                    report.released.push(line.channel.name.clone());
                    report.changes.extend(change);
                }
                Err(error) => report.failures.push(error),
            }
        }
        report
    }

    /// Write every output whose effective value differs from the hardware.
    pub fn reconcile(&mut self, hardware: &mut dyn HardwareIo) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for line in &mut self.lines {
            match line.drive(hardware) {
                Ok(change) => report.changes.extend(change),
                Err(error) => report.failures.push(error),
            }
        }
        report
    }

    pub fn states(&self) -> BTreeMap<String, OutputState> {
        self.lines
            .iter()
            .map(|l| (l.channel.name.clone(), l.state()))
            .collect()
    }

    pub fn state(&self, channel: &str) -> Option<OutputState> {
        self.lines
            .iter()
            .find(|l| l.channel.name == channel)
            .map(Line::state)
    }

    pub fn role(&self, channel: &str) -> Option<OutputRole> {
        self.lines
            .iter()
            .find(|l| l.channel.name == channel)
            .map(|l| l.role)
    }

    /// Channel names and roles, in configuration order.
    pub fn roles(&self) -> BTreeMap<String, OutputRole> {
        self.lines
            .iter()
            .map(|l| (l.channel.name.clone(), l.role))
            .collect()
    }

    /// Last value the rules asked for on each channel.
    pub fn automatic_values(&self) -> BTreeMap<String, bool> {
        self.lines
            .iter()
            .map(|l| (l.channel.name.clone(), l.automatic))
            .collect()
    }

    pub fn manual_overrides(&self) -> BTreeMap<String, bool> {
        self.lines
            .iter()
            .filter_map(|l| Some((l.channel.name.clone(), l.manual?)))
            .collect()
    }

    pub fn is_safety_held(&self, channel: &str) -> bool {
        self.lines
            .iter()
            .any(|l| l.channel.name == channel && l.safety.is_some())
    }

    pub fn is_pulsing(&self, channel: &str) -> bool {
        self.lines
            .iter()
            .any(|l| l.channel.name == channel && l.pulse.is_some())
    }
}
