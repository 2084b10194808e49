//! Oximeter Service Module
//!
//! Owns the worker thread that runs the connection state machine and the
//! two queues connecting it to the caller. Every public method only touches
//! a queue, so callers never block on the BLE stack.

use crate::domain::models::{
    Candidate, ConnectionState, Device, OximeterCommand, OximeterEvent,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionMachine};
use crate::infrastructure::bluetooth::protocol::{Packet, ProtocolError};
use crate::infrastructure::bluetooth::queue::MessageQueue;
use crate::infrastructure::bluetooth::transport::BleTransport;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Pacing of the worker loop
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Extra sleep while nothing is in progress
    pub idle_backoff: Duration,
    pub connection: ConnectionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(500),
            connection: ConnectionConfig::default(),
        }
    }
}

impl From<&Settings> for WorkerConfig {
    fn from(s: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            idle_backoff: Duration::from_millis(s.idle_backoff_ms),
            connection: ConnectionConfig {
                inactivity_timeout: Duration::from_millis(s.inactivity_timeout_ms),
                max_service_scan_retries: s.max_service_scan_retries,
                drop_corrupt_frames: s.drop_corrupt_frames,
            },
        }
    }
}

/// Caller-side handle to the BLE worker
pub struct OximeterService {
    commands: MessageQueue<OximeterCommand>,
    events: MessageQueue<OximeterEvent>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl OximeterService {
    /// Start the worker thread over `transport` with pacing from `settings`
    pub fn spawn<T>(settings: &Settings, transport: T) -> Result<Self>
    where
        T: BleTransport + Send + 'static,
    {
        Self::spawn_with(WorkerConfig::from(settings), transport)
    }

    pub fn spawn_with<T>(config: WorkerConfig, transport: T) -> Result<Self>
    where
        T: BleTransport + Send + 'static,
    {
        let commands = MessageQueue::new();
        let events = MessageQueue::new();
        let running = Arc::new(AtomicBool::new(true));

        let machine = ConnectionMachine::new(transport, config.connection.clone(), events.clone());
        let worker = Worker {
            machine,
            commands: commands.clone(),
            running: Arc::clone(&running),
            poll_interval: config.poll_interval,
            idle_backoff: config.idle_backoff,
        };

        let handle = thread::Builder::new()
            .name("oximeter-worker".to_string())
            .spawn(move || worker.run())
            .context("Failed to spawn oximeter worker thread")?;

        Ok(Self {
            commands,
            events,
            running,
            worker: Some(handle),
        })
    }

    pub fn start_scan(&self, prefix: impl Into<String>) {
        self.submit(OximeterCommand::StartScan(prefix.into()));
    }

    pub fn stop_scan(&self) {
        self.submit(OximeterCommand::StopScan);
    }

    pub fn connect(&self, candidate: Candidate) {
        self.submit(OximeterCommand::Connect(candidate));
    }

    /// Queue raw frame bytes for the command characteristic of `device`
    pub fn send(&self, device: &Device, frame: Vec<u8>) {
        self.submit(OximeterCommand::Send(device.clone(), frame));
    }

    /// Encode `packet` and queue it for `device`
    pub fn send_packet(&self, device: &Device, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = packet.encode()?;
        self.send(device, frame);
        Ok(())
    }

    pub fn disconnect(&self, device: &Device) {
        self.submit(OximeterCommand::Disconnect(device.clone()));
    }

    pub fn submit(&self, command: OximeterCommand) {
        self.commands.push(command);
    }

    /// Everything the worker reported since the last call, oldest first
    pub fn drain_events(&self) -> Vec<OximeterEvent> {
        self.events.drain()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for it to release the transport
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            info!("Stopping oximeter worker");
            if handle.join().is_err() {
                error!("Oximeter worker panicked");
            }
        }
    }
}

impl Drop for OximeterService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<T: BleTransport> {
    machine: ConnectionMachine<T>,
    commands: MessageQueue<OximeterCommand>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    idle_backoff: Duration,
}

impl<T: BleTransport> Worker<T> {
    fn run(mut self) {
        info!("Oximeter worker started");
        while self.running.load(Ordering::Acquire) {
            let pending = self.commands.drain();
            self.machine.tick(pending, Instant::now());

            if self.machine.state() == ConnectionState::Idle {
                thread::sleep(self.idle_backoff);
            }
            thread::sleep(self.poll_interval);
        }
        self.machine.shutdown();
        info!("Oximeter worker stopped");
    }
}
