use cabinetd::config::LoopConfig;
use cabinetd::hardware::InputBits;
use cabinetd::outputs::OutputError;
use cabinetd::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const DOOR_1: BusAddress = BusAddress::Input {
    port: cabinetd::channel::Port::A,
    pin: 0,
};
const FLOOD_1: BusAddress = BusAddress::Input {
    port: cabinetd::channel::Port::A,
    pin: 4,
};

fn quick_config() -> ControllerConfig {
    ControllerConfig {
        loops: LoopConfig {
            fast_tick_ms: 10,
            logic_tick_ms: 50,
            climate_refresh_ms: None,
            auxiliary_refresh_ms: 500,
        },
        ..ControllerConfig::default()
    }
}

fn start() -> (ControllerHandle, SimulatorHandle, Arc<MemorySink>) {
    let (hardware, sim) = SimulatedHardware::with_sensors(["cabinet", "battery"]);
    sim.set_input_level(FLOOD_1, true);
    let events = Arc::new(MemorySink::new());
    let handle = match ControlLoop::start(quick_config(), Box::new(hardware), events.clone()) {
        Ok(handle) => handle,
        Err(e) => panic!("control loop failed to start: {e}"),
    };
    (handle, sim, events)
}

async fn wait_for(handle: &ControllerHandle, condition: impl Fn(&SystemSnapshot) -> bool) -> Arc<SystemSnapshot> {
    let mut updates = handle.subscribe();
    let waited = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = Arc::clone(&updates.borrow_and_update());
            if condition(&snapshot) {
                return snapshot;
            }
            if updates.changed().await.is_err() {
                return handle.snapshot();
            }
        }
    })
    .await;
    match waited {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("condition not reached, last snapshot: {:?}", handle.snapshot()),
    }
}

async fn running(handle: &ControllerHandle) -> Arc<SystemSnapshot> {
    wait_for(handle, |s| s.phase == LoopPhase::Running).await
}

/// Simulated board whose input bank takes longer to read than a fast period.
struct SlowBank {
    inner: SimulatedHardware,
    delay: Duration,
}

impl HardwareIo for SlowBank {
    fn read_digital_bank(&mut self) -> Result<InputBits, HardwareError> {
        std::thread::sleep(self.delay);
        self.inner.read_digital_bank()
    }

    fn write_relay(&mut self, relay: u8, on: bool) -> Result<(), HardwareError> {
        self.inner.write_relay(relay, on)
    }

    fn write_transistor(&mut self, transistor: u8, on: bool) -> Result<(), HardwareError> {
        self.inner.write_transistor(transistor, on)
    }

    fn read_temperature(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        self.inner.read_temperature(sensor)
    }

    fn read_humidity(&mut self, sensor: &str) -> Result<f32, HardwareError> {
        self.inner.read_humidity(sensor)
    }

    fn release(&mut self) {
        self.inner.release();
    }

    fn backend(&self) -> &'static str {
        "slow-bank"
    }
}

/// Outputs before and after a door opens on a cabinet at 27 C: either set
/// may be published, never a mix.
fn door_state_is_consistent(snapshot: &SystemSnapshot) -> Option<bool> {
    let hvac_off = ["heating", "fan_230v", "fan_48v"].iter().all(|c| !snapshot.is_on(c));
    let door = snapshot.input("door_1").map(|i| i.stable);

    let closed = door == Some(false)
        && snapshot.alarm_reason.is_none()
        && snapshot.is_on("cooling")
        && hvac_off
        && !snapshot.is_on("alarm")
        && !snapshot.is_on("light");
    let open = door == Some(true)
        && snapshot.alarm_reason.as_deref() == Some("Door open")
        && !snapshot.is_on("cooling")
        && hvac_off
        && snapshot.is_on("alarm")
        && snapshot.is_on("light");

    match (closed, open) {
        (true, _) => Some(false),
        (_, true) => Some(true),
        _ => None,
    }
}

#[test]
fn test_start_requires_runtime() {
    let (hardware, _sim) = SimulatedHardware::new();
    let result = ControlLoop::start(quick_config(), Box::new(hardware), Arc::new(MemorySink::new()));
    assert!(matches!(result, Err(StartupError::NoRuntime)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_fails_when_bank_is_silent() {
    let (hardware, sim) = SimulatedHardware::new();
    sim.fail_bank_reads(1);
    let result = ControlLoop::start(quick_config(), Box::new(hardware), Arc::new(MemorySink::new()));
    assert!(matches!(result, Err(StartupError::Hardware(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_warms_up_and_publishes() {
    let (handle, _sim, _events) = start();

    // The initial snapshot is available before any tick
    let initial = handle.snapshot();
    assert_eq!(initial.outputs.len(), 7);

    let snapshot = running(&handle).await;
    assert!(snapshot.sequence > initial.sequence);
    assert_eq!(snapshot.control_temperature_c, Some(20.0));
    assert!(snapshot.stats.fast_ticks >= 1);

    let health = handle.health();
    assert_eq!(health.phase, LoopPhase::Running);
    assert!(health.fast_tick_age_ms.is_some());
    assert!(health.logic_tick_age_ms.is_some());

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_command_visible_once_acknowledged() {
    let (handle, sim, events) = start();
    running(&handle).await;

    let ack = handle.submit_manual_command("light", Some(true), true).unwrap();
    ack.applied().await.unwrap();

    // The snapshot is published before the acknowledgement resolves
    assert!(handle.snapshot().is_on("light"));
    assert!(sim.relay(3));
    assert_eq!(events.of_type(EventType::Manual).len(), 1);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_rejected_synchronously() {
    let (handle, _sim, _events) = start();
    running(&handle).await;

    assert_eq!(
        handle.submit_manual_command("light", Some(true), false).err(),
        Some(Rejection::NotPrivileged)
    );
    assert_eq!(
        handle.submit_manual_command("sprinkler", Some(true), true).err(),
        Some(Rejection::UnknownChannel("sprinkler".into()))
    );
    assert_eq!(
        handle.submit_manual_command("strike_1", Some(true), true).err(),
        Some(Rejection::NotManualCapable("strike_1".into()))
    );
    assert_eq!(
        handle.trigger_strike("light", None).err(),
        Some(Rejection::NotStrikeCapable("light".into()))
    );
    assert!(matches!(
        handle.trigger_strike("strike_1", Some(Duration::from_secs(120))),
        Err(Rejection::InvalidDuration { .. })
    ));

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_write_reported_through_ack() {
    let (handle, sim, _events) = start();
    running(&handle).await;
    sim.fail_output(BusAddress::Relay(3), true);

    let ack = handle.submit_manual_command("light", Some(true), true).unwrap();
    let result = ack.applied().await;
    assert!(matches!(result, Err(CommandError::Output(OutputError::Write { .. }))));
    assert!(!handle.snapshot().is_on("light"));

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strike_pulse_expires() {
    let (handle, sim, events) = start();
    running(&handle).await;

    let ack = handle.trigger_strike("strike_1", Some(Duration::from_millis(300))).unwrap();
    ack.applied().await.unwrap();
    assert!(sim.transistor(2));
    assert!(handle.snapshot().output("strike_1").is_some_and(|o| o.pulse.is_some()));

    // A second pulse while the first runs is refused up front
    assert_eq!(
        handle.trigger_strike("strike_1", None).err(),
        Some(Rejection::AlreadyPulsing("strike_1".into()))
    );

    wait_for(&handle, |s| s.output("strike_1").is_some_and(|o| o.pulse.is_none())).await;
    assert!(!sim.transistor(2));

    let released: Vec<Event> = events
        .of_type(EventType::Strike)
        .into_iter()
        .filter(|e| e.message.ends_with("released"))
        .collect();
    assert_eq!(released.len(), 1);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_door_input_reaches_snapshot() {
    let (handle, sim, _events) = start();
    running(&handle).await;

    sim.set_input_level(DOOR_1, true);
    let snapshot = wait_for(&handle, |s| s.alarm_reason.is_some()).await;
    assert_eq!(snapshot.alarm_reason.as_deref(), Some("Door open"));
    assert!(snapshot.is_on("alarm"));
    assert!(snapshot.is_on("light"));
    assert_eq!(
        handle.submit_manual_command("cooling", Some(true), true).err(),
        Some(Rejection::SafetyInterlock("cooling".into()))
    );

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_global_mode_commands_acknowledged() {
    let (handle, _sim, _events) = start();
    running(&handle).await;

    handle.set_manual_mode_global(true).unwrap().applied().await.unwrap();
    handle.set_buzzer_muted(true).unwrap().applied().await.unwrap();

    let snapshot = handle.snapshot();
    assert!(snapshot.manual_mode);
    assert!(snapshot.buzzer_muted);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_sequence_is_monotonic_for_readers() {
    let (handle, sim, _events) = start();
    running(&handle).await;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut last = 0;
                for _ in 0..50 {
                    let snapshot = handle.snapshot();
                    assert!(snapshot.sequence >= last);
                    last = snapshot.sequence;
                    sleep(Duration::from_millis(2)).await;
                }
            })
        })
        .collect();

    // Keep the loop busy publishing while the readers poll
    for i in 0..10 {
        sim.set_temperature("cabinet", 20.0 + i as f32);
        sleep(Duration::from_millis(10)).await;
    }
    for reader in readers {
        reader.await.unwrap();
    }

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_half_applied_rules() {
    let (handle, sim, _events) = start();
    sim.set_temperature("cabinet", 27.0);
    sim.set_temperature("battery", 27.0);
    wait_for(&handle, |s| s.phase == LoopPhase::Running && s.is_on("cooling")).await;

    let pollers: Vec<_> = (0..3)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut seen = 0u32;
                loop {
                    let snapshot = handle.snapshot();
                    seen += 1;
                    match door_state_is_consistent(&snapshot) {
                        Some(true) => return seen,
                        Some(false) => tokio::task::yield_now().await,
                        None => panic!("mixed snapshot {}: {snapshot:?}", snapshot.sequence),
                    }
                }
            })
        })
        .collect();

    let mut updates = handle.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            let snapshot = Arc::clone(&updates.borrow_and_update());
            match door_state_is_consistent(&snapshot) {
                Some(true) => return,
                Some(false) => {}
                None => panic!("mixed snapshot {}: {snapshot:?}", snapshot.sequence),
            }
            if updates.changed().await.is_err() {
                return;
            }
        }
    });

    sleep(Duration::from_millis(30)).await;
    sim.set_input_level(DOOR_1, true);

    let finished = timeout(Duration::from_secs(5), async {
        for poller in pollers {
            assert!(poller.await.unwrap() > 0);
        }
        watcher.await.unwrap();
    })
    .await;
    assert!(finished.is_ok(), "door never reached the snapshot");

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_bank_does_not_starve_logic_tick() {
    let (hardware, sim) = SimulatedHardware::with_sensors(["cabinet", "battery"]);
    sim.set_input_level(FLOOD_1, true);
    let config = ControllerConfig {
        loops: LoopConfig {
            fast_tick_ms: 50,
            logic_tick_ms: 100,
            climate_refresh_ms: None,
            auxiliary_refresh_ms: 500,
        },
        ..ControllerConfig::default()
    };
    let slow = SlowBank {
        inner: hardware,
        delay: Duration::from_millis(60),
    };
    let handle = match ControlLoop::start(config, Box::new(slow), Arc::new(MemorySink::new())) {
        Ok(handle) => handle,
        Err(e) => panic!("control loop failed to start: {e}"),
    };

    // Every fast tick overruns its period, yet the loop still warms up
    running(&handle).await;
    let first = handle.health();
    assert!(first.logic_tick_age_ms.is_some());

    sleep(Duration::from_millis(600)).await;
    let later = handle.health();
    assert_eq!(later.phase, LoopPhase::Running);
    assert!(
        later.logic_ticks >= first.logic_ticks + 2,
        "logic ticks stalled: {first:?} -> {later:?}"
    );
    assert!(later.fast_ticks > first.fast_ticks);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_counters_advance_on_quiet_cabinet() {
    let (handle, _sim, _events) = start();
    running(&handle).await;
    sleep(Duration::from_millis(50)).await;

    let before = handle.health();
    let published = handle.snapshot().stats.fast_ticks;
    sleep(Duration::from_millis(200)).await;
    let after = handle.health();

    // Nothing changes on the cabinet, yet the live counters keep moving
    assert!(after.fast_ticks > before.fast_ticks + 5);
    assert!(after.fast_ticks > published);
    assert!(after.logic_ticks > before.logic_ticks);
    assert_eq!(after.hardware_errors, 0);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_idempotent_and_final() {
    let (handle, sim, _events) = start();
    running(&handle).await;
    let other = handle.clone();

    handle.stop().await;
    other.stop().await;
    handle.stop().await;

    assert_eq!(handle.snapshot().phase, LoopPhase::Stopped);
    assert!(sim.is_released());
    assert!(!handle.health().healthy);

    assert_eq!(
        handle.submit_manual_command("light", Some(true), true).err(),
        Some(Rejection::LoopStopped)
    );
    assert_eq!(handle.set_manual_mode_global(true).err(), Some(Rejection::LoopStopped));
    assert_eq!(other.set_buzzer_muted(true).err(), Some(Rejection::LoopStopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_handles_stops_loop() {
    let (handle, sim, _events) = start();
    running(&handle).await;
    drop(handle);

    let released = timeout(Duration::from_secs(5), async {
        while !sim.is_released() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "bus was not released after the last handle dropped");
}
