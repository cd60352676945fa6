//! Operator commands, their synchronous validation and acknowledgements.

use crate::channel::OutputRole;
use crate::config::ControllerConfig;
use crate::outputs::OutputError;
use crate::snapshot::SystemSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// `None` clears the override.
    SetManual { channel: String, desired: Option<bool> },
    TriggerStrike { channel: String, duration: Duration },
    SetManualMode { enabled: bool },
    SetBuzzerMuted { muted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("caller is not privileged to issue manual commands")]
    NotPrivileged,
    #[error("unknown output channel `{0}`")]
    UnknownChannel(String),
    #[error("channel `{0}` does not accept manual overrides")]
    NotManualCapable(String),
    #[error("channel `{0}` is held by a door or flood safety rule")]
    SafetyInterlock(String),
    #[error("channel `{0}` is not a strike output")]
    NotStrikeCapable(String),
    #[error("strike `{0}` is already pulsing")]
    AlreadyPulsing(String),
    #[error("strike duration {requested_ms} ms is outside 1..={max_ms} ms")]
    InvalidDuration { requested_ms: u64, max_ms: u64 },
    #[error("control loop is not running")]
    LoopStopped,
}

/// Outcome of applying a queued command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("command failed: {0}")]
    Output(#[from] OutputError),
    #[error("control loop stopped before applying the command")]
    Dropped,
}

/// Resolves once the control loop has applied (or refused) a command.
#[derive(Debug)]
pub struct Acknowledgement {
    rx: oneshot::Receiver<Result<(), CommandError>>,
}

impl Acknowledgement {
    pub async fn applied(self) -> Result<(), CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::Dropped))
    }
}

#[derive(Debug)]
pub(crate) struct QueuedCommand {
    pub command: Command,
    pub ack: oneshot::Sender<Result<(), CommandError>>,
}

impl QueuedCommand {
    pub fn new(command: Command) -> (Self, Acknowledgement) {
        let (ack, rx) = oneshot::channel();
        (Self { command, ack }, Acknowledgement { rx })
    }

    pub fn complete(self, result: Result<(), CommandError>) {
        // The caller may have dropped its acknowledgement.
        let _ = self.ack.send(result);
    }
}

/// Check a manual override against the latest published state.
pub fn check_manual(snapshot: &SystemSnapshot, channel: &str) -> Result<(), Rejection> {
    let output = snapshot
        .output(channel)
        .ok_or_else(|| Rejection::UnknownChannel(channel.to_string()))?;
    if output.role == OutputRole::Strike {
        return Err(Rejection::NotManualCapable(channel.to_string()));
    }
    if output.safety.is_some() {
        return Err(Rejection::SafetyInterlock(channel.to_string()));
    }
    Ok(())
}

/// Check a strike request and resolve its duration.
pub fn check_strike(
    snapshot: &SystemSnapshot,
    config: &ControllerConfig,
    channel: &str,
    duration: Option<Duration>,
) -> Result<Duration, Rejection> {
    let output = snapshot
        .output(channel)
        .ok_or_else(|| Rejection::UnknownChannel(channel.to_string()))?;
    if output.role != OutputRole::Strike {
        return Err(Rejection::NotStrikeCapable(channel.to_string()));
    }

    let duration = duration.unwrap_or_else(|| config.strike.default_duration());
    let max = config.strike.max_duration();
    if duration.is_zero() || duration > max {
        return Err(Rejection::InvalidDuration {
            requested_ms: duration.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        });
    }
    if output.pulse.is_some() && !config.strike.allow_retrigger {
        return Err(Rejection::AlreadyPulsing(channel.to_string()));
    }
    Ok(duration)
}
