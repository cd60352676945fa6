//! Alarm conditions and their edge detection.

use crate::events::{Event, EventType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlarmKind {
    DoorOpen,
    FloodDetected,
    Overheat,
    SensorFault,
}

impl AlarmKind {
    /// Label used in the snapshot's alarm reason.
    pub fn description(self) -> &'static str {
        match self {
            AlarmKind::DoorOpen => "Door open",
            AlarmKind::FloodDetected => "Flood detected",
            AlarmKind::Overheat => "Overtemperature",
            AlarmKind::SensorFault => "Sensor fault",
        }
    }

    pub fn event_type(self) -> EventType {
        match self {
            AlarmKind::DoorOpen => EventType::Door,
            AlarmKind::FloodDetected => EventType::Flood,
            AlarmKind::Overheat => EventType::Temp,
            AlarmKind::SensorFault => EventType::Sensor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmCondition {
    pub kind: AlarmKind,
    pub severity: Severity,
    pub message: String,
    pub channel: Option<String>,
}

impl AlarmCondition {
    pub fn new(kind: AlarmKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            channel: None,
        }
    }

    #[must_use]
    pub fn on(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    fn key(&self) -> (AlarmKind, Option<String>) {
        (self.kind, self.channel.clone())
    }
}

/// Human-readable summary, e.g. `"Door open; Flood detected"`.
pub fn alarm_reason(conditions: &[AlarmCondition]) -> Option<String> {
    let mut kinds: Vec<AlarmKind> = conditions.iter().map(|c| c.kind).collect();
    kinds.sort_unstable();
    kinds.dedup();
    if kinds.is_empty() {
        return None;
    }
    Some(
        kinds
            .iter()
            .map(|k| k.description())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEdge {
    pub condition: AlarmCondition,
    pub raised: bool,
}

impl AlarmEdge {
    pub fn to_event(&self) -> Event {
        let condition = &self.condition;
        let (severity, message) = if self.raised {
            (condition.severity, condition.message.clone())
        } else {
            (Severity::Info, format!("{} cleared", condition.kind.description()))
        };
        let event = Event::new(condition.kind.event_type(), severity, message);
        match &condition.channel {
            Some(channel) => event.with_channel(channel.clone()),
            None => event,
        }
    }
}

/// Remembers which conditions were active at the last evaluation so that
/// each appearance and disappearance is reported exactly once.
#[derive(Debug, Default)]
pub struct AlarmTracker {
    active: BTreeMap<(AlarmKind, Option<String>), AlarmCondition>,
}

impl AlarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, current: &[AlarmCondition]) -> Vec<AlarmEdge> {
        let next: BTreeMap<_, _> = current.iter().map(|c| (c.key(), c.clone())).collect();

        let mut edges: Vec<AlarmEdge> = self
            .active
            .iter()
            .filter(|(key, _)| !next.contains_key(*key))
            .map(|(_, condition)| AlarmEdge {
                condition: condition.clone(),
                raised: false,
            })
            .collect();
        edges.extend(
            next.iter()
                .filter(|(key, _)| !self.active.contains_key(*key))
                .map(|(_, condition)| AlarmEdge {
                    condition: condition.clone(),
                    raised: true,
                }),
        );

        self.active = next;
        edges
    }

    pub fn active(&self) -> impl Iterator<Item = &AlarmCondition> {
        self.active.values()
    }
}
