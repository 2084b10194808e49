//! BLE Connection State Machine
//!
//! Drives discovery, GATT matching, subscription and streaming against a
//! polling [`BleTransport`]. One call to [`ConnectionMachine::tick`] applies
//! the pending commands and performs a single non-blocking poll for the
//! current state.

use crate::domain::models::{
    is_command_uuid, Candidate, ConnectionState, Device, OximeterCommand, OximeterEvent,
};
use crate::infrastructure::bluetooth::protocol::{Packet, MAX_FRAME_LEN};
use crate::infrastructure::bluetooth::queue::MessageQueue;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicInfo, CharacteristicTarget, DeviceUpdate, ScanStatus,
};
use crate::infrastructure::bluetooth::watchdog::{StallMonitor, DEFAULT_INACTIVITY_TIMEOUT};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Silence tolerated while streaming before a forced disconnect
    pub inactivity_timeout: Duration,
    /// Extra service scans after an empty result before giving up
    pub max_service_scan_retries: u32,
    /// Discard frames whose checksum does not match
    pub drop_corrupt_frames: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_service_scan_retries: 3,
            drop_corrupt_frames: false,
        }
    }
}

/// Discovery progress for the candidate being connected
#[derive(Debug, Default)]
struct Discovery {
    candidate: Option<Candidate>,
    services: Vec<String>,
    service_index: usize,
    characteristics: Vec<CharacteristicInfo>,
    retries: u32,
}

pub struct ConnectionMachine<T: BleTransport> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    prefix: String,
    candidates: HashMap<String, Candidate>,
    discovery: Discovery,
    connected: Option<Device>,
    monitor: StallMonitor,
    events: MessageQueue<OximeterEvent>,
}

impl<T: BleTransport> ConnectionMachine<T> {
    pub fn new(transport: T, config: ConnectionConfig, events: MessageQueue<OximeterEvent>) -> Self {
        let monitor = StallMonitor::new(config.inactivity_timeout);
        Self {
            transport,
            config,
            state: ConnectionState::Idle,
            prefix: String::new(),
            candidates: HashMap::new(),
            discovery: Discovery::default(),
            connected: None,
            monitor,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected_device(&self) -> Option<&Device> {
        self.connected.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Apply `commands` in order, then poll once for the current state
    pub fn tick(&mut self, commands: Vec<OximeterCommand>, now: Instant) {
        for command in commands {
            let name = command.name();
            if !self.apply(command) {
                debug!("Dropped {} command in state {:?}", name, self.state);
            }
        }

        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::ScanningDevices => self.poll_devices(),
            ConnectionState::ScanningServices => self.poll_services(),
            ConnectionState::ScanningCharacteristics => self.poll_characteristics(now),
            ConnectionState::Streaming => self.poll_stream(now),
        }
    }

    /// Release the transport; the machine is unusable afterwards
    pub fn shutdown(&mut self) {
        info!("Shutting down BLE transport");
        self.transport.shutdown();
    }

    /// Returns false when the command does not fit the current state
    fn apply(&mut self, command: OximeterCommand) -> bool {
        match command {
            OximeterCommand::StartScan(prefix) => {
                match self.state {
                    ConnectionState::ScanningDevices => self.transport.stop_device_scan(),
                    ConnectionState::Idle => {}
                    _ => return false,
                }
                info!("Start scanning for prefix \"{}\"", prefix);
                self.prefix = prefix;
                self.candidates.clear();
                self.transport.start_device_scan();
                self.set_state(ConnectionState::ScanningDevices);
                true
            }
            OximeterCommand::StopScan => {
                if self.state != ConnectionState::ScanningDevices {
                    return false;
                }
                info!("Stop scanning");
                self.transport.stop_device_scan();
                self.set_state(ConnectionState::Idle);
                true
            }
            OximeterCommand::Connect(candidate) => {
                if self.state != ConnectionState::Idle {
                    return false;
                }
                info!("Connecting to candidate {}", candidate);
                self.transport.scan_services(&candidate.address);
                self.discovery = Discovery {
                    candidate: Some(candidate),
                    ..Discovery::default()
                };
                self.set_state(ConnectionState::ScanningServices);
                true
            }
            OximeterCommand::Send(device, frame) => {
                let Some(connected) = self.streaming_device(&device) else {
                    return false;
                };
                if frame.len() > MAX_FRAME_LEN {
                    self.emit(OximeterEvent::Error("data size wrong".to_string()));
                    return true;
                }
                let target = CharacteristicTarget {
                    device_address: connected.address.clone(),
                    service_uuid: connected.service_uuid.clone(),
                    characteristic_uuid: connected.command_characteristic.clone(),
                };
                debug!(
                    "Writing value {:02X?} at {} from service {}",
                    frame, target.characteristic_uuid, target.service_uuid
                );
                if let Err(e) = self.transport.send_data(&target, &frame) {
                    self.emit(OximeterEvent::Error(format!("send failed: {}", e)));
                }
                true
            }
            OximeterCommand::Disconnect(device) => {
                if self.streaming_device(&device).is_none() {
                    return false;
                }
                info!("Disconnecting {} ({})", device.name, device.address);
                self.drop_connection();
                true
            }
        }
    }

    /// The connected device, if streaming and `device` refers to it
    fn streaming_device(&self, device: &Device) -> Option<Device> {
        if self.state != ConnectionState::Streaming {
            return None;
        }
        self.connected.as_ref().filter(|c| c.is_same(device)).cloned()
    }

    fn poll_devices(&mut self) {
        match self.transport.poll_device() {
            ScanStatus::Available(update) => self.on_device_update(update),
            ScanStatus::Finished => {
                // The OS ends scans after a while; device scanning is meant to be endless.
                info!("Device scan window ended, restarting");
                self.transport.start_device_scan();
            }
            ScanStatus::Processing => {}
        }
    }

    fn on_device_update(&mut self, update: DeviceUpdate) {
        trace!(
            "Scan polled device {} {:?}, connectable: {}",
            update.id,
            update.name,
            update.is_connectable
        );

        if let Some(name) = update.name.as_deref() {
            if name.to_lowercase().starts_with(&self.prefix.to_lowercase()) {
                let candidate = Candidate::new(name, update.id.clone());
                debug!("Scan polled candidate {}", candidate);
                self.candidates.insert(update.id.clone(), candidate);
            }
        }

        if update.is_connectable {
            if let Some(candidate) = self.candidates.get(&update.id).cloned() {
                debug!("Scan candidate connectable {}", candidate);
                self.emit(OximeterEvent::Found(candidate));
            }
        }
    }

    fn poll_services(&mut self) {
        match self.transport.poll_service() {
            ScanStatus::Available(uuid) => {
                debug!("Polled service {}", uuid);
                self.discovery.services.push(uuid);
            }
            ScanStatus::Finished => self.on_services_finished(),
            ScanStatus::Processing => {}
        }
    }

    fn on_services_finished(&mut self) {
        let Some(candidate) = self.discovery.candidate.clone() else {
            self.abort_discovery();
            return;
        };

        if self.discovery.services.is_empty() {
            let message = match self.transport.last_error() {
                Some(e) => format!("no services: {}", e),
                None => "no services".to_string(),
            };
            self.emit(OximeterEvent::Error(message));

            if self.discovery.retries < self.config.max_service_scan_retries {
                self.discovery.retries += 1;
                warn!(
                    "No services on {}, rescanning (attempt {}/{})",
                    candidate, self.discovery.retries, self.config.max_service_scan_retries
                );
                self.transport.scan_services(&candidate.address);
            } else {
                self.emit(OximeterEvent::Error(format!(
                    "service discovery gave up after {} retries",
                    self.discovery.retries
                )));
                self.abort_discovery();
            }
            return;
        }

        self.discovery.service_index = 0;
        self.scan_current_service(&candidate);
    }

    fn scan_current_service(&mut self, candidate: &Candidate) {
        let service = &self.discovery.services[self.discovery.service_index];
        debug!("Scanning characteristics of service {}", service);
        self.transport.scan_characteristics(&candidate.address, service);
        self.discovery.characteristics.clear();
        self.set_state(ConnectionState::ScanningCharacteristics);
    }

    fn poll_characteristics(&mut self, now: Instant) {
        match self.transport.poll_characteristic() {
            ScanStatus::Available(characteristic) => {
                debug!("Polled characteristic {}", characteristic.uuid);
                self.discovery.characteristics.push(characteristic);
            }
            ScanStatus::Finished => self.on_characteristics_finished(now),
            ScanStatus::Processing => {}
        }
    }

    fn on_characteristics_finished(&mut self, now: Instant) {
        let Some(candidate) = self.discovery.candidate.clone() else {
            self.abort_discovery();
            return;
        };
        let Some(service) = self
            .discovery
            .services
            .get(self.discovery.service_index)
            .cloned()
        else {
            self.abort_discovery();
            return;
        };

        let has_command = self
            .discovery
            .characteristics
            .iter()
            .any(|c| is_command_uuid(&c.uuid));

        if has_command {
            info!("Command characteristic found in service {}", service);
            self.establish(&candidate, &service, now);
            return;
        }

        self.discovery.service_index += 1;
        if self.discovery.service_index < self.discovery.services.len() {
            self.scan_current_service(&candidate);
        } else {
            self.emit(OximeterEvent::Error("command UUID not found".to_string()));
            self.abort_discovery();
        }
    }

    fn establish(&mut self, candidate: &Candidate, service_uuid: &str, now: Instant) {
        let device = Device::from_candidate(candidate, service_uuid);

        for uuid in device.notify_characteristics() {
            debug!("Subscribing characteristic {} from service {}", uuid, service_uuid);
            let target = CharacteristicTarget {
                device_address: device.address.clone(),
                service_uuid: service_uuid.to_string(),
                characteristic_uuid: uuid.clone(),
            };
            if let Err(e) = self.transport.subscribe_characteristic(&target) {
                self.emit(OximeterEvent::Error(format!("subscribe error: {}", e)));
            }
        }

        self.discovery = Discovery::default();
        self.connected = Some(device.clone());
        self.monitor.reset(now);
        self.set_state(ConnectionState::Streaming);
        info!("Connected to {} ({})", device.name, device.address);
        self.emit(OximeterEvent::Connected(device));
    }

    fn poll_stream(&mut self, now: Instant) {
        if let Some(address) = self.transport.poll_link_lost() {
            if self.connected.as_ref().is_some_and(|d| d.address == address) {
                info!("Transport reported link loss for {}", address);
                self.drop_connection();
                return;
            }
        }

        let Some(notification) = self.transport.poll_data() else {
            if self.monitor.is_stalled(now) {
                info!(
                    "Last recv timeout elapsed ({:?} > {:?}), disconnecting",
                    self.monitor.elapsed(now).unwrap_or_default(),
                    self.monitor.timeout()
                );
                self.drop_connection();
            }
            return;
        };

        self.monitor.reset(now);
        let Some(device) = self.connected.clone() else {
            return;
        };

        let packet = Packet::decode(&notification.data);
        trace!(
            "Received {:?} frame at {} of service {}",
            packet.payload_type(),
            notification.characteristic_uuid,
            notification.service_uuid
        );

        if !packet.checksum_ok && self.config.drop_corrupt_frames {
            warn!("Dropping frame with bad checksum: {:02X?}", notification.data);
            self.emit(OximeterEvent::Error(format!(
                "checksum mismatch on {}",
                notification.characteristic_uuid
            )));
            return;
        }

        self.emit(OximeterEvent::Received(device, packet));
    }

    /// Tear down the current connection and report it once
    fn drop_connection(&mut self) {
        let Some(device) = self.connected.take() else {
            return;
        };
        self.transport.shutdown_device(&device.address);
        self.monitor.disarm();
        self.set_state(ConnectionState::Idle);
        self.emit(OximeterEvent::Disconnected(device));
    }

    fn abort_discovery(&mut self) {
        self.discovery = Discovery::default();
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("State {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&self, event: OximeterEvent) {
        if let OximeterEvent::Error(message) = &event {
            warn!("Error {}", message);
        }
        self.events.push(event);
    }
}
