//! The control loop actor and its public handle.
//!
//! One task owns the [`Controller`]. Each tick moves the controller onto the
//! blocking pool, runs it, and moves it back, so bus I/O never stalls the
//! executor, snapshot readers or command submitters. Snapshots are published
//! through a `watch` channel; commands arrive on an unbounded queue and are
//! applied at the start of the next fast tick.

use crate::commands::{check_manual, check_strike, Acknowledgement, Command, CommandError, QueuedCommand, Rejection};
use crate::config::{ControllerConfig, SensorClass};
use crate::controller::{Controller, StartupError};
use crate::events::{wall_clock_ms, EventSink};
use crate::hardware::HardwareIo;
use crate::snapshot::{Health, Heartbeat, LoopPhase, SystemSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Fast,
    Logic,
    Sensor(SensorClass),
}

impl Tick {
    fn name(self) -> &'static str {
        match self {
            Tick::Fast => "fast",
            Tick::Logic => "logic",
            Tick::Sensor(SensorClass::Climate) => "climate",
            Tick::Sensor(SensorClass::Auxiliary) => "auxiliary",
        }
    }
}

pub struct ControlLoop;

impl ControlLoop {
    /// Build the controller and spawn its actor on the current runtime.
    ///
    /// Fails without spawning anything if the configuration is invalid or
    /// the hardware does not answer.
    pub fn start(
        config: ControllerConfig,
        hardware: Box<dyn HardwareIo>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ControllerHandle, StartupError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StartupError::NoRuntime)?;

        let mut controller = Controller::new(config, hardware, sink)?;
        let config = Arc::clone(controller.config());
        controller.take_dirty();
        let initial = Arc::new(controller.snapshot());

        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = Arc::new(Heartbeat::new());

        let actor = Actor {
            controller: Some(controller),
            config: Arc::clone(&config),
            commands: command_rx,
            snapshots: snapshot_tx,
            stop: stop_rx,
            heartbeat: Arc::clone(&heartbeat),
        };
        let task = runtime.spawn(actor.run());

        Ok(ControllerHandle {
            inner: Arc::new(HandleInner {
                config,
                commands: command_tx,
                snapshots: snapshot_rx,
                stop: stop_tx,
                heartbeat,
                task: Mutex::new(Some(task)),
            }),
        })
    }
}

struct Actor {
    controller: Option<Controller>,
    config: Arc<ControllerConfig>,
    commands: mpsc::UnboundedReceiver<QueuedCommand>,
    snapshots: watch::Sender<Arc<SystemSnapshot>>,
    stop: watch::Receiver<bool>,
    heartbeat: Arc<Heartbeat>,
}

fn schedule(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Actor {
    async fn run(mut self) {
        let loops = &self.config.loops;
        let fast_period = loops.fast_period();
        let logic_period = loops.logic_period();
        let climate_period = loops.climate_period();
        let auxiliary_period = loops.auxiliary_period();

        let mut fast = schedule(fast_period);
        let mut logic = schedule(logic_period);
        let mut climate = schedule(climate_period.unwrap_or(logic_period));
        let mut auxiliary = schedule(auxiliary_period);
        let climate_scheduled = climate_period.is_some();

        info!(
            fast_ms = fast_period.as_millis() as u64,
            logic_ms = logic_period.as_millis() as u64,
            "control loop started"
        );

        // Slow schedules are polled before the fast one: a fast tick that
        // overruns its period is ready again on every pass and would
        // otherwise starve them.
        while !*self.stop.borrow() {
            let (tick, scheduled, period) = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        debug!("all controller handles dropped");
                    }
                    break;
                }
                at = logic.tick() => (Tick::Logic, at, logic_period),
                at = climate.tick(), if climate_scheduled => {
                    (Tick::Sensor(SensorClass::Climate), at, climate_period.unwrap_or(logic_period))
                }
                at = auxiliary.tick() => (Tick::Sensor(SensorClass::Auxiliary), at, auxiliary_period),
                at = fast.tick() => (Tick::Fast, at, fast_period),
            };

            let missed = self.missed_ticks(tick, scheduled, period);
            if !self.run_tick(tick, missed).await {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Periods that elapsed between the scheduled instant and now.
    fn missed_ticks(&self, tick: Tick, scheduled: Instant, period: Duration) -> u64 {
        let late = Instant::now().saturating_duration_since(scheduled);
        if late < period || period.is_zero() {
            return 0;
        }
        let missed = (late.as_nanos() / period.as_nanos()) as u64;
        warn!(
            schedule = tick.name(),
            late_ms = late.as_millis() as u64,
            missed,
            "tick ran late"
        );
        self.heartbeat.missed(missed);
        missed
    }

    /// Run one tick on the blocking pool. Returns false if the controller
    /// was lost.
    async fn run_tick(&mut self, tick: Tick, missed: u64) -> bool {
        let Some(mut controller) = self.controller.take() else {
            return false;
        };

        let mut queued = Vec::new();
        if tick == Tick::Fast {
            while let Ok(command) = self.commands.try_recv() {
                queued.push(command);
            }
        }

        let result = tokio::task::spawn_blocking(move || {
            let now = std::time::Instant::now();
            if missed > 0 {
                controller.record_missed_ticks(missed);
            }
            let results: Vec<(QueuedCommand, Result<(), CommandError>)> = queued
                .into_iter()
                .map(|q| {
                    let result = controller.apply_command(q.command.clone(), now);
                    (q, result)
                })
                .collect();
            match tick {
                Tick::Fast => controller.fast_tick(now),
                Tick::Logic => controller.logic_tick(now),
                Tick::Sensor(class) => controller.sensor_tick(class, now),
            }
            let snapshot = controller.take_dirty().then(|| Arc::new(controller.snapshot()));
            (controller, results, snapshot)
        })
        .await;

        match result {
            Ok((controller, results, snapshot)) => {
                let wall_ms = wall_clock_ms();
                match tick {
                    Tick::Fast => self.heartbeat.fast_tick(wall_ms),
                    Tick::Logic => self.heartbeat.logic_tick(wall_ms),
                    Tick::Sensor(_) => {}
                }
                self.heartbeat.set_phase(controller.phase());
                self.heartbeat.record(controller.stats());
                if let Some(snapshot) = snapshot {
                    self.snapshots.send_replace(snapshot);
                }
                for (queued, result) in results {
                    if let Err(e) = &result {
                        warn!(command = ?queued.command, error = %e, "command not applied");
                    }
                    queued.complete(result);
                }
                self.controller = Some(controller);
                true
            }
            Err(e) => {
                error!(schedule = tick.name(), error = %e, "tick aborted, stopping control loop");
                self.heartbeat.set_phase(LoopPhase::Stopped);
                false
            }
        }
    }

    async fn shutdown(mut self) {
        self.commands.close();
        while let Ok(queued) = self.commands.try_recv() {
            queued.complete(Err(Rejection::LoopStopped.into()));
        }

        if let Some(mut controller) = self.controller.take() {
            let stopped = tokio::task::spawn_blocking(move || {
                controller.shutdown();
                controller.snapshot()
            })
            .await;
            match stopped {
                Ok(snapshot) => {
                    self.snapshots.send_replace(Arc::new(snapshot));
                }
                Err(e) => error!(error = %e, "controller shutdown aborted"),
            }
        } else {
            // Controller was lost in a failed tick; publish what we last had.
            let mut last = SystemSnapshot::clone(&self.snapshots.borrow());
            last.phase = LoopPhase::Stopped;
            last.sequence += 1;
            self.snapshots.send_replace(Arc::new(last));
        }
        self.heartbeat.set_phase(LoopPhase::Stopped);
        info!("control loop stopped");
    }
}

struct HandleInner {
    config: Arc<ControllerConfig>,
    commands: mpsc::UnboundedSender<QueuedCommand>,
    snapshots: watch::Receiver<Arc<SystemSnapshot>>,
    stop: watch::Sender<bool>,
    heartbeat: Arc<Heartbeat>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable access to a running control loop. The loop stops when
/// [`ControllerHandle::stop`] is called or every handle is dropped.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<HandleInner>,
}

impl ControllerHandle {
    /// Latest published snapshot. Never blocks on the tick.
    pub fn snapshot(&self) -> Arc<SystemSnapshot> {
        Arc::clone(&self.inner.snapshots.borrow())
    }

    /// Receiver that is notified on every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemSnapshot>> {
        self.inner.snapshots.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    fn enqueue(&self, command: Command) -> Result<Acknowledgement, Rejection> {
        if *self.inner.stop.borrow() {
            return Err(Rejection::LoopStopped);
        }
        let (queued, ack) = QueuedCommand::new(command);
        self.inner
            .commands
            .send(queued)
            .map_err(|_| Rejection::LoopStopped)?;
        Ok(ack)
    }

    /// Set (`Some`) or clear (`None`) a manual override.
    pub fn submit_manual_command(
        &self,
        channel: &str,
        desired: Option<bool>,
        privileged: bool,
    ) -> Result<Acknowledgement, Rejection> {
        if !privileged {
            return Err(Rejection::NotPrivileged);
        }
        check_manual(&self.snapshot(), channel)?;
        self.enqueue(Command::SetManual {
            channel: channel.to_string(),
            desired,
        })
    }

    /// Energize a strike for `duration`, or the configured default.
    pub fn trigger_strike(&self, channel: &str, duration: Option<Duration>) -> Result<Acknowledgement, Rejection> {
        let duration = check_strike(&self.snapshot(), &self.inner.config, channel, duration)?;
        self.enqueue(Command::TriggerStrike {
            channel: channel.to_string(),
            duration,
        })
    }

    pub fn set_manual_mode_global(&self, enabled: bool) -> Result<Acknowledgement, Rejection> {
        self.enqueue(Command::SetManualMode { enabled })
    }

    pub fn set_buzzer_muted(&self, muted: bool) -> Result<Acknowledgement, Rejection> {
        self.enqueue(Command::SetBuzzerMuted { muted })
    }

    pub fn health(&self) -> Health {
        let loops = &self.inner.config.loops;
        self.inner
            .heartbeat
            .health(wall_clock_ms(), loops.fast_period(), loops.logic_period())
    }

    /// Ask the loop to stop and wait for it. The in-flight tick completes
    /// first. Safe to call more than once, from any clone.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let mut task = self.inner.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "control loop task failed");
            }
        }
    }
}
