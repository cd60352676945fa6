use cabinetd::config::ControllerConfig;
use cabinetd::events::{ChannelSink, Event, EventSink, FanoutSink, Severity, TracingSink};
use cabinetd::hardware::simulator::{SimulatedHardware, SimulatorHandle, ThermalModel};
use cabinetd::{ControlLoop, ControllerHandle, LoopPhase, OutputRole, SystemSnapshot};
use clap::{App, Arg};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, Level};

const SCENARIO_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cabinetd")
        .version("0.1.0")
        .author("Cabinet Systems Engineering Team")
        .about("Equipment cabinet controller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (defaults are used when omitted)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .short("s")
                .long("simulate")
                .value_name("SCENARIO")
                .help("Run against the simulated cabinet, optionally replaying a scenario")
                .takes_value(true)
                .min_values(0)
                .possible_values(&["idle", "door", "flood", "overheat", "sensor-fault", "strike"]),
        )
        .arg(
            Arg::with_name("status")
                .long("status")
                .help("Print one snapshot as JSON once the loop is running, then exit"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("SECONDS")
                .help("Status table interval")
                .takes_value(true)
                .default_value("10")
                .validator(|v| match v.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Interval must be a positive number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };

    if !matches.is_present("simulate") {
        eprintln!(
            "{} no bus backend is attached to this binary; run with --simulate",
            "error:".red().bold()
        );
        eprintln!("       firmware builds construct CabinetBus from their SPI devices");
        std::process::exit(2);
    }
    let scenario = matches.value_of("simulate").unwrap_or("idle").to_string();
    let interval = Duration::from_secs(matches.value_of("interval").unwrap_or("10").parse()?);

    let (hardware, sim) = SimulatedHardware::with_sensors(config.sensors.iter().map(|s| s.id.as_str()));
    sim.enable_thermal_model(ThermalModel::default());
    idle_inputs(&config, &sim);

    let (events, mut event_rx) = ChannelSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink), Arc::new(events)];
    let handle = ControlLoop::start(config.clone(), Box::new(hardware), Arc::new(FanoutSink::new(sinks)))?;

    if matches.is_present("status") {
        let snapshot = wait_until_running(&handle).await;
        println!("{}", serde_json::to_string_pretty(&*snapshot)?);
        handle.stop().await;
        return Ok(());
    }

    println!("{}", "Cabinet controller (simulated)".bold());
    println!("{}", "==============================".bold());

    let scenario_task = tokio::spawn(run_scenario(scenario, config, sim, handle.clone()));

    let mut table = time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            Some(event) = event_rx.recv() => print_event(&event),
            _ = table.tick() => print_status(&handle.snapshot()),
        }
    }

    scenario_task.abort();
    handle.stop().await;
    print_status(&handle.snapshot());
    Ok(())
}

/// Doors closed, flood sensors dry, honouring the configured polarity.
fn idle_inputs(config: &ControllerConfig, sim: &SimulatorHandle) {
    for door in &config.inputs.doors {
        sim.set_input_level(door.address, !config.inputs.door_open_is_high);
    }
    for flood in &config.inputs.floods {
        sim.set_input_level(flood.address, config.inputs.flood_active_is_low);
    }
}

async fn wait_until_running(handle: &ControllerHandle) -> Arc<SystemSnapshot> {
    let mut updates = handle.subscribe();
    loop {
        let snapshot = handle.snapshot();
        if snapshot.phase != LoopPhase::Warming {
            return snapshot;
        }
        if updates.changed().await.is_err() {
            return handle.snapshot();
        }
    }
}

async fn run_scenario(scenario: String, config: ControllerConfig, sim: SimulatorHandle, handle: ControllerHandle) {
    time::sleep(SCENARIO_DELAY).await;
    let first_door = config.inputs.doors.first().map(|d| d.address);
    let first_flood = config.inputs.floods.first().map(|f| f.address);

    match scenario.as_str() {
        "door" => {
            if let Some(address) = first_door {
                info!("scenario: opening {address}");
                sim.set_input_level(address, config.inputs.door_open_is_high);
            }
        }
        "flood" => {
            if let Some(address) = first_flood {
                info!("scenario: flooding {address}");
                sim.set_input_level(address, !config.inputs.flood_active_is_low);
            }
        }
        "overheat" => {
            let target = config.thresholds.fan_on_c + 5.0;
            info!("scenario: heating cabinet to {target:.1} C");
            for sensor in &config.sensors {
                sim.set_temperature(&sensor.id, target);
            }
        }
        "sensor-fault" => {
            if let Some(sensor) = config.sensors.first() {
                info!("scenario: {} stops answering", sensor.id);
                sim.fail_sensor(&sensor.id, true);
            }
        }
        "strike" => {
            let strike = config.outputs.iter().find(|o| o.role == OutputRole::Strike);
            if let Some(strike) = strike {
                match handle.trigger_strike(&strike.name, None) {
                    Ok(ack) => {
                        if let Err(e) = ack.applied().await {
                            error!("strike failed: {e}");
                        }
                    }
                    Err(e) => error!("strike rejected: {e}"),
                }
            }
        }
        _ => {}
    }
}

fn print_event(event: &Event) {
    let tag = format!("[{:?}]", event.event_type).to_uppercase();
    let line = format!("{tag} {}", event.message);
    match event.severity {
        Severity::Info => println!("{}", line.cyan()),
        Severity::Warning => println!("{}", line.yellow()),
        Severity::Critical => println!("{}", line.red().bold()),
    }
}

fn print_status(snapshot: &SystemSnapshot) {
    let phase = match snapshot.phase {
        LoopPhase::Running => "RUNNING".green(),
        LoopPhase::Warming => "WARMING".yellow(),
        LoopPhase::Stopped => "STOPPED".red(),
    };
    println!();
    println!("{} #{}  {}", "Status".bold(), snapshot.sequence, phase);

    match snapshot.control_temperature_c {
        Some(t) => println!("  Control temperature: {t:.1} C"),
        None => println!("  Control temperature: {}", "n/a".yellow()),
    }
    if snapshot.safe_mode {
        println!("  {}", "Safe mode: heating and cooling held off".yellow());
    }
    if snapshot.manual_mode {
        println!("  {}", "Manual mode".magenta());
    }
    match &snapshot.alarm_reason {
        Some(reason) => println!("  Alarm: {}", reason.red().bold()),
        None => println!("  Alarm: {}", "none".green()),
    }

    println!("  Outputs:");
    for (name, output) in &snapshot.outputs {
        let state = if output.active { "ON ".green() } else { "OFF".dimmed() };
        println!("    {:<10} {:<3} {} ({:?})", name, output.address.to_string(), state, output.source);
    }
    println!("  Inputs:");
    for (name, input) in &snapshot.inputs {
        let state = if input.stable { "ACTIVE".red() } else { "idle".green() };
        println!("    {name:<10} {state}");
    }
    println!("  Sensors:");
    for (id, reading) in &snapshot.sensors {
        let temperature = reading
            .temperature_c
            .map_or_else(|| "--".to_string(), |t| format!("{t:.1} C"));
        println!("    {:<10} {:<8} {:?}", id, temperature, reading.status);
    }
    println!(
        "  Ticks: fast {} logic {} missed {} hw errors {}",
        snapshot.stats.fast_ticks, snapshot.stats.logic_ticks, snapshot.stats.missed_ticks, snapshot.stats.hardware_errors
    );
}
