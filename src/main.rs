//! Command-line front end for the pulse oximeter core.
//!
//! Scans for devices whose advertised name matches the prefix, connects to
//! the remembered address (or the first match), runs the handshake and prints
//! every reading until interrupted.
//!
//! Usage:
//!   oximeter --simulate --duration-secs 30

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use pulse_oximeter_ble::infrastructure::bluetooth::simulator::{SimulatedOximeter, SimulatorOptions};
use pulse_oximeter_ble::infrastructure::bluetooth::transport::BleTransport;
use pulse_oximeter_ble::infrastructure::logging::init_logger;
use pulse_oximeter_ble::{
    open_transport, OximeterCommand, OximeterEvent, OximeterService, PayloadType, SessionConfig,
    SessionController, SettingsService, TransportKind,
};
use tracing::{info, warn};

/// BLE pulse oximeter client.
#[derive(Parser)]
#[command(name = "oximeter", about = "Scan for, connect to and stream from a BLE pulse oximeter")]
struct Cli {
    /// Use the built-in simulated oximeter instead of the system Bluetooth stack.
    #[arg(long)]
    simulate: bool,

    /// Advertised-name prefix to match, case-insensitively.
    #[arg(long)]
    prefix: Option<String>,

    /// Connect to this device address as soon as it is seen.
    #[arg(long)]
    address: Option<String>,

    /// Remember the connected device for auto-connect on later runs.
    #[arg(long)]
    remember: bool,

    /// Forget the remembered device before scanning.
    #[arg(long, conflicts_with = "remember")]
    forget: bool,

    /// Exit after this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Settings file to use instead of the per-user one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Make the simulated device go silent after this many readings.
    #[arg(long)]
    sim_stall_after: Option<u32>,
}

fn submit(service: &OximeterService, commands: Vec<OximeterCommand>) {
    for command in commands {
        service.submit(command);
    }
}

fn report(event: &OximeterEvent) {
    match event {
        OximeterEvent::Found(candidate) => println!("found      {}", candidate),
        OximeterEvent::Connected(device) => {
            println!("connected  {} ({})", device.name, device.address)
        }
        OximeterEvent::Disconnected(device) => {
            println!("lost       {} ({})", device.name, device.address)
        }
        OximeterEvent::Received(_, packet) => match packet.payload_type() {
            PayloadType::Reading => {
                if let Ok(r) = packet.reading() {
                    println!(
                        "reading    PR {:>3} bpm  SpO2 {:>3}%  PI {:>4.1}  RR {:>4} ms  SDNN {:>3}  battery {:>3}%  #{}",
                        r.pr,
                        r.spo2,
                        r.perfusion_index(),
                        r.rr_interval_ms(),
                        r.sdnn,
                        r.battery,
                        r.sample_index
                    );
                }
            }
            PayloadType::Mac => {
                if let Ok(mac) = packet.mac() {
                    println!("mac        {}", mac);
                }
            }
            other => println!("response   {:?} {:02X?}", other, packet.payload.bytes()),
        },
        OximeterEvent::Error(message) => eprintln!("error      {}", message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };

    // Command-line overrides apply to this run only
    let mut settings = settings_service.get().clone();
    if cli.simulate {
        settings.transport = TransportKind::Simulated;
    }
    if let Some(prefix) = &cli.prefix {
        settings.scan_prefix = prefix.clone();
    }
    if let Some(address) = &cli.address {
        settings.auto_connect_address = Some(address.clone());
    }

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Starting pulse oximeter client");
    info!("Settings file: {}", settings_service.path().display());

    if cli.forget {
        match settings_service.forget_address() {
            Ok(()) => info!("Forgot the remembered device"),
            Err(e) => warn!("Failed to save settings: {}", e),
        }
    }

    let transport: Box<dyn BleTransport + Send> = match settings.transport {
        TransportKind::Simulated => Box::new(SimulatedOximeter::transport(SimulatorOptions {
            stall_after: cli.sim_stall_after,
            ..SimulatorOptions::default()
        })),
        TransportKind::WinRt => open_transport(&settings)?,
    };

    let mut service = OximeterService::spawn(&settings, transport)?;
    let mut session = SessionController::new(SessionConfig::from(&settings));
    // An explicit --address still wins for this run
    let forget_for_run = cli.forget && cli.address.is_none();
    if forget_for_run {
        session.forget_remembered();
    }
    let pick_first = forget_for_run || settings.auto_connect_address.is_none();
    let mut selecting = false;
    let mut remembered = false;

    submit(&service, session.start());

    let deadline = cli
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for event in service.drain_events() {
            report(&event);
            match &event {
                OximeterEvent::Connected(_) | OximeterEvent::Disconnected(_) => selecting = false,
                OximeterEvent::Error(_) if session.connected().is_none() => selecting = false,
                _ => {}
            }
            let commands = session.handle_event(event, now);
            submit(&service, commands);
        }
        submit(&service, session.tick(now));

        if pick_first && !selecting && session.connected().is_none() {
            if let Some(candidate) = session.candidates().first().cloned() {
                selecting = true;
                let commands = session.select(candidate);
                submit(&service, commands);
            }
        }

        if cli.remember && !remembered {
            if let Some(address) = session.remember_connected() {
                match settings_service.remember_address(&address) {
                    Ok(()) => info!("Remembered {} for auto-connect", address),
                    Err(e) => warn!("Failed to save settings: {}", e),
                }
                remembered = true;
            }
        }

        if deadline.is_some_and(|d| now >= d) {
            info!("Run duration elapsed");
            break;
        }
    }

    service.shutdown();
    Ok(())
}
