//! # Cabinet Controller
//!
//! Control loop and hardware abstraction layer for an equipment cabinet:
//! door contacts and flood sensors on a digital input bank, temperature and
//! humidity probes, and relay/transistor outputs for alarm, lighting, HVAC,
//! emergency fans, buzzer and door strikes.
//!
//! ## Features
//!
//! - **Anti-glitch inputs**: count-based debouncing with flood anti-flap
//! - **Fault-tolerant sensors**: tri-state readings with a failure threshold
//! - **Prioritized rules**: door > flood > overheat > comfort, sensor safe mode
//! - **Manual override**: per channel and global, never above door/flood safety
//! - **Timed strikes**: door-release pulses with expiry enforced by the loop
//! - **Atomic snapshots**: readers always see a fully formed system state
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cabinetd::{ControlLoop, ControllerConfig, SimulatedHardware, TracingSink};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::default();
//! let (hardware, _sim) = SimulatedHardware::new();
//! let handle = ControlLoop::start(config, Box::new(hardware), Arc::new(TracingSink))?;
//!
//! let snapshot = handle.snapshot();
//! println!("phase: {:?}", snapshot.phase);
//!
//! handle.trigger_strike("strike_1", None)?.applied().await?;
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`hardware`] - Bus access trait, simulator and MCP23S17/DHT11/1-Wire backend
//! - [`debounce`] - Digital input anti-glitch filter
//! - [`sensors`] - Climate sensor sampling and failure tracking
//! - [`outputs`] - Output precedence, hardware writes and strike pulses
//! - [`rules`] - Fixed-priority safety and comfort policy
//! - [`alarms`] - Alarm conditions and edge detection
//! - [`controller`] - Tick logic over the single state container
//! - [`control_loop`] - Scheduler, command queue and public handle

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod alarms;
pub mod channel;
pub mod commands;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod debounce;
pub mod events;
pub mod hardware;
pub mod outputs;
pub mod rules;
pub mod sensors;
pub mod snapshot;

// Re-export main public types for convenience
pub use channel::{BusAddress, Channel, ChannelKind, OutputRole};
pub use commands::{Acknowledgement, Command, CommandError, Rejection};
pub use config::ControllerConfig;
pub use control_loop::{ControlLoop, ControllerHandle};
pub use controller::{Controller, StartupError};
pub use events::{Event, EventSink, EventType, MemorySink, Severity, TracingSink};
pub use hardware::simulator::{SimulatedHardware, SimulatorHandle};
pub use hardware::{HardwareError, HardwareIo};
pub use snapshot::{Health, LoopPhase, SystemSnapshot};
