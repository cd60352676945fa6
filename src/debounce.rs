//! Anti-glitch filter for the digital inputs.
//!
//! A channel's stable value changes only after `threshold` consecutive raw
//! samples disagree with it, and is first set only after `threshold`
//! consecutive samples agree. Flood channels additionally hold a committed
//! value for an anti-flap window before accepting the next change.

use crate::channel::{Channel, ChannelKind};
use crate::config::InputConfig;
use crate::hardware::InputBits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Per-channel filter state. `raw` and `stable` are logical values
/// (polarity already applied): `true` means door open or flood present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    pub raw: bool,
    pub stable: bool,
    pub last_change_ms: Option<u64>,
    pub mismatch_count: u32,
}

/// A committed stable-value transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEdge {
    pub channel: String,
    pub kind: ChannelKind,
    pub active: bool,
    pub at_ms: u64,
}

#[derive(Debug)]
struct FilteredInput {
    channel: Channel,
    bit: u8,
    active_high: bool,
    hold_off: Duration,
    hold_until: Option<Instant>,
    /// Candidate first value and its run length, until initialized.
    settling: Option<(bool, u32)>,
    state: Option<InputState>,
}

impl FilteredInput {
    fn sample(&mut self, bits: InputBits, threshold: u32, now: Instant, wall_ms: u64) -> Option<InputEdge> {
        let level = bits & (1 << self.bit) != 0;
        let raw = level == self.active_high;

        if self.state.is_none() {
            self.settle(raw, threshold);
            return None;
        }
        let state = self.state.as_mut()?;

        state.raw = raw;
        if raw == state.stable {
            state.mismatch_count = 0;
            return None;
        }

        state.mismatch_count = state.mismatch_count.saturating_add(1).min(threshold);
        if state.mismatch_count < threshold {
            return None;
        }
        if self.hold_until.is_some_and(|until| now < until) {
            return None;
        }

        state.stable = raw;
        state.last_change_ms = Some(wall_ms);
        state.mismatch_count = 0;
        if !self.hold_off.is_zero() {
            self.hold_until = Some(now + self.hold_off);
        }
        Some(InputEdge {
            channel: self.channel.name.clone(),
            kind: self.channel.kind,
            active: raw,
            at_ms: wall_ms,
        })
    }

    fn settle(&mut self, raw: bool, threshold: u32) {
        let run = match self.settling {
            Some((candidate, run)) if candidate == raw => run.saturating_add(1),
            _ => 1,
        };
        if run < threshold {
            self.settling = Some((raw, run));
            return;
        }
        self.settling = None;
        self.state = Some(InputState {
            raw,
            stable: raw,
            last_change_ms: None,
            mismatch_count: 0,
        });
    }
}

#[derive(Debug)]
pub struct InputDebouncer {
    inputs: Vec<FilteredInput>,
    threshold: u32,
}

impl InputDebouncer {
    pub fn new(config: &InputConfig) -> Self {
        let hold_off = Duration::from_millis(config.flood_anti_flap_ms);
        let doors = config.doors.iter().map(|c| {
            (
                Channel::new(c.name.clone(), c.address, ChannelKind::Door),
                config.door_open_is_high,
                Duration::ZERO,
            )
        });
        let floods = config.floods.iter().map(|c| {
            (
                Channel::new(c.name.clone(), c.address, ChannelKind::Flood),
                !config.flood_active_is_low,
                hold_off,
            )
        });
        Self::from_channels(doors.chain(floods), config.debounce_samples)
    }

    /// Build from `(channel, active_high, hold_off)` triples. Channels whose
    /// address is not on the input bank are ignored.
    pub fn from_channels(
        channels: impl IntoIterator<Item = (Channel, bool, Duration)>,
        threshold: u32,
    ) -> Self {
        let inputs = channels
            .into_iter()
            .filter_map(|(channel, active_high, hold_off)| {
                let bit = channel.address.input_bit()?;
                Some(FilteredInput {
                    channel,
                    bit,
                    active_high,
                    hold_off,
                    hold_until: None,
                    settling: None,
                    state: None,
                })
            })
            .collect();
        Self {
            inputs,
            threshold: threshold.max(1),
        }
    }

    /// Feed one bank read. Returns every committed transition, each once.
    pub fn sample(&mut self, bits: InputBits, now: Instant, wall_ms: u64) -> Vec<InputEdge> {
        let threshold = self.threshold;
        self.inputs
            .iter_mut()
            .filter_map(|input| input.sample(bits, threshold, now, wall_ms))
            .collect()
    }

    /// True once every channel has seen its first agreeing run.
    pub fn is_initialized(&self) -> bool {
        self.inputs.iter().all(|i| i.state.is_some())
    }

    pub fn states(&self) -> BTreeMap<String, InputState> {
        self.inputs
            .iter()
            .filter_map(|i| Some((i.channel.name.clone(), i.state.clone()?)))
            .collect()
    }

    pub fn state(&self, channel: &str) -> Option<&InputState> {
        self.inputs
            .iter()
            .find(|i| i.channel.name == channel)
            .and_then(|i| i.state.as_ref())
    }

    /// Names of channels of `kind` whose stable value is active.
    pub fn active(&self, kind: ChannelKind) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|i| i.channel.kind == kind)
            .filter(|i| i.state.as_ref().is_some_and(|s| s.stable))
            .map(|i| i.channel.name.clone())
            .collect()
    }
}
