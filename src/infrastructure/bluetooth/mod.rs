//! Bluetooth Module
//!
//! Provides BLE communication with the pulse oximeter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    OximeterService                       │
//! │  (caller handle: command queue in, event queue out)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ worker thread
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionMachine                       │
//! │  Idle → ScanningDevices → ScanningServices →             │
//! │  ScanningCharacteristics → Streaming  (+ StallMonitor)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ BleTransport (polling)
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────┐          ┌─────────────────┐
//! │ PushTransport │◄─────────│ CallbackBackend │
//! │  (PushSink)   │  pushes  │ WinRt/Simulated │
//! └───────────────┘          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame codec, UUIDs and typed payloads
//! - [`transport`] - Polling contract the state machine drives
//! - [`connection`] - Connection state machine
//! - [`queue`] - Lock-protected FIFOs between caller and worker
//! - [`watchdog`] - Stream inactivity detection
//! - [`push`] - Adapter from callback stacks to the polling contract
//! - [`simulator`] - In-process simulated oximeter
//! - `winrt` - Windows BLE backend (Windows only)
//! - [`service`] - Worker thread and caller handle

pub mod connection;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod service;
pub mod simulator;
pub mod transport;
pub mod watchdog;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod testing;

pub use service::OximeterService;

use crate::domain::settings::{Settings, TransportKind};
use simulator::{SimulatedOximeter, SimulatorOptions};
use transport::BleTransport;

/// Build the transport selected in `settings`
pub fn open_transport(settings: &Settings) -> anyhow::Result<Box<dyn BleTransport + Send>> {
    match settings.transport {
        TransportKind::Simulated => {
            tracing::info!("Using simulated oximeter");
            Ok(Box::new(SimulatedOximeter::transport(SimulatorOptions::default())))
        }
        TransportKind::WinRt => open_winrt(),
    }
}

#[cfg(windows)]
fn open_winrt() -> anyhow::Result<Box<dyn BleTransport + Send>> {
    tracing::info!("Using WinRT Bluetooth LE");
    let transport = push::PushTransport::try_with_backend(winrt::WinRtBackend::start)?;
    Ok(Box::new(transport))
}

#[cfg(not(windows))]
fn open_winrt() -> anyhow::Result<Box<dyn BleTransport + Send>> {
    anyhow::bail!("The WinRT Bluetooth backend is only available on Windows; use the simulated transport")
}
