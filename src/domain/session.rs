//! Caller-side session logic.
//!
//! Turns worker events into follow-up commands: candidate bookkeeping,
//! auto-connect to the remembered device, the post-connect handshake and
//! rescanning after a disconnect. Nothing here touches a thread or a clock;
//! the owner feeds events and the current time in.

use crate::domain::models::{Candidate, Device, OximeterCommand, OximeterEvent};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{
    DisplayMode, MacAddress, Packet, Payload, Reading, DEFAULT_NAME_PREFIX,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scan_prefix: String,
    pub auto_connect_address: Option<String>,
    pub auth_password: [u8; 2],
    /// Wait after `Connected` before the first command is written
    pub handshake_delay: Duration,
    pub rescan_delay: Duration,
    pub request_mac: bool,
    pub display_mode: Option<DisplayMode>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_prefix: DEFAULT_NAME_PREFIX.to_string(),
            auto_connect_address: None,
            auth_password: [0x00, 0x00],
            handshake_delay: Duration::from_secs(2),
            rescan_delay: Duration::from_secs(3),
            request_mac: true,
            display_mode: None,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            scan_prefix: s.scan_prefix.clone(),
            auto_connect_address: s.auto_connect_address.clone(),
            auth_password: s.auth_password,
            handshake_delay: s.handshake_delay(),
            rescan_delay: s.rescan_delay(),
            request_mac: s.request_mac_on_connect,
            display_mode: s.display_mode,
        }
    }
}

#[derive(Debug)]
pub struct SessionController {
    config: SessionConfig,
    candidates: Vec<Candidate>,
    connected: Option<Device>,
    auto_connect_armed: bool,
    handshake_due: Option<Instant>,
    rescan_due: Option<Instant>,
    latest_reading: Option<Reading>,
    device_mac: Option<MacAddress>,
    authenticated: Option<bool>,
    last_error: Option<String>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            candidates: Vec::new(),
            connected: None,
            auto_connect_armed: true,
            handshake_due: None,
            rescan_due: None,
            latest_reading: None,
            device_mac: None,
            authenticated: None,
            last_error: None,
        }
    }

    /// Begin a fresh scan
    pub fn start(&mut self) -> Vec<OximeterCommand> {
        self.candidates.clear();
        self.rescan_due = None;
        vec![OximeterCommand::StartScan(self.config.scan_prefix.clone())]
    }

    /// User picked `candidate` from the list
    pub fn select(&mut self, candidate: Candidate) -> Vec<OximeterCommand> {
        info!("Selected {}", candidate);
        vec![OximeterCommand::StopScan, OximeterCommand::Connect(candidate)]
    }

    pub fn disconnect(&self) -> Vec<OximeterCommand> {
        self.connected
            .iter()
            .map(|d| OximeterCommand::Disconnect(d.clone()))
            .collect()
    }

    pub fn handle_event(&mut self, event: OximeterEvent, now: Instant) -> Vec<OximeterCommand> {
        match event {
            OximeterEvent::Found(candidate) => return self.on_found(candidate),
            OximeterEvent::Connected(device) => {
                info!("Connected to {} ({})", device.name, device.address);
                self.auto_connect_armed = false;
                self.latest_reading = None;
                self.device_mac = None;
                self.authenticated = None;
                self.handshake_due = Some(now + self.config.handshake_delay);
                self.connected = Some(device);
            }
            OximeterEvent::Disconnected(device) => {
                if self.connected.as_ref().is_some_and(|d| d.is_same(&device)) {
                    info!("Disconnected from {}, rescanning in {:?}", device.name, self.config.rescan_delay);
                    self.connected = None;
                    self.handshake_due = None;
                    self.latest_reading = None;
                    self.candidates.clear();
                    self.rescan_due = Some(now + self.config.rescan_delay);
                }
            }
            OximeterEvent::Received(device, packet) => {
                if self.connected.as_ref().is_some_and(|d| d.is_same(&device)) {
                    self.on_packet(packet);
                }
            }
            OximeterEvent::Error(message) => {
                warn!("Worker error: {}", message);
                self.last_error = Some(message);
            }
        }
        Vec::new()
    }

    /// Fire due timers
    pub fn tick(&mut self, now: Instant) -> Vec<OximeterCommand> {
        let mut commands = Vec::new();

        if self.handshake_due.is_some_and(|due| now >= due) {
            self.handshake_due = None;
            if let Some(device) = self.connected.clone() {
                commands.extend(self.handshake(&device));
            }
        }

        if self.rescan_due.is_some_and(|due| now >= due) {
            commands.extend(self.start());
        }

        commands
    }

    /// Address to persist when the user wants this device remembered
    pub fn remember_connected(&mut self) -> Option<String> {
        let address = self.connected.as_ref()?.address.clone();
        self.config.auto_connect_address = Some(address.clone());
        Some(address)
    }

    pub fn forget_remembered(&mut self) {
        self.config.auto_connect_address = None;
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn connected(&self) -> Option<&Device> {
        self.connected.as_ref()
    }

    pub fn latest_reading(&self) -> Option<&Reading> {
        self.latest_reading.as_ref()
    }

    pub fn device_mac(&self) -> Option<MacAddress> {
        self.device_mac
    }

    /// `None` until the device answered the auth command
    pub fn authenticated(&self) -> Option<bool> {
        self.authenticated
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_remembered(&self, address: &str) -> bool {
        self.config.auto_connect_address.as_deref() == Some(address)
    }

    fn on_found(&mut self, candidate: Candidate) -> Vec<OximeterCommand> {
        if !self.candidates.iter().any(|c| c.address == candidate.address) {
            debug!("New candidate {}", candidate);
            self.candidates.push(candidate.clone());
        }

        if self.auto_connect_armed && self.connected.is_none() && self.is_remembered(&candidate.address) {
            info!("Found auto connect target {}", candidate);
            return vec![OximeterCommand::StopScan, OximeterCommand::Connect(candidate)];
        }
        Vec::new()
    }

    fn on_packet(&mut self, packet: Packet) {
        match &packet.payload {
            Payload::Reading(_) => match packet.reading() {
                Ok(reading) => self.latest_reading = Some(reading),
                Err(e) => warn!("Bad reading payload: {}", e),
            },
            Payload::Mac(_) => match packet.mac() {
                Ok(mac) => {
                    info!("Device MAC {}", mac);
                    self.device_mac = Some(mac);
                }
                Err(e) => warn!("Bad MAC payload: {}", e),
            },
            Payload::Auth(bytes) => {
                let accepted = bytes.first() == Some(&0x00);
                info!("Auth {}", if accepted { "accepted" } else { "rejected" });
                self.authenticated = Some(accepted);
            }
            Payload::Display(bytes) => debug!("Display mode acknowledged {:02X?}", bytes),
            Payload::Unknown { type_byte, .. } => {
                debug!("Ignoring payload type {:#04x}", type_byte)
            }
        }
    }

    fn handshake(&self, device: &Device) -> Vec<OximeterCommand> {
        let mut packets = vec![Packet::auth_command(self.config.auth_password)];
        if self.config.request_mac {
            packets.push(Packet::mac_command());
        }
        if let Some(mode) = self.config.display_mode {
            packets.push(Packet::display_command(mode));
        }

        packets
            .iter()
            .filter_map(|packet| match packet.encode() {
                Ok(frame) => Some(OximeterCommand::Send(device.clone(), frame)),
                Err(e) => {
                    error!("Failed to encode {:?} command: {}", packet.payload_type(), e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::PayloadType;

    const ADDR: &str = "aa:bb:cc:dd:ee:ff";

    fn device() -> Device {
        Device::from_candidate(&Candidate::new("iF-Oxi", ADDR), "fff0")
    }

    fn remembered() -> SessionController {
        SessionController::new(SessionConfig {
            auto_connect_address: Some(ADDR.to_string()),
            ..SessionConfig::default()
        })
    }

    #[test]
    fn test_found_is_deduplicated() {
        let mut session = SessionController::new(SessionConfig::default());
        let now = Instant::now();
        session.handle_event(OximeterEvent::Found(Candidate::new("iF-Oxi", ADDR)), now);
        session.handle_event(OximeterEvent::Found(Candidate::new("iF-Oxi", ADDR)), now);
        session.handle_event(OximeterEvent::Found(Candidate::new("iF-Two", "11")), now);
        assert_eq!(session.candidates().len(), 2);
    }

    #[test]
    fn test_auto_connect_to_remembered_address() {
        let mut session = remembered();
        let candidate = Candidate::new("iF-Oxi", ADDR);

        let other = session.handle_event(OximeterEvent::Found(Candidate::new("iF-Two", "11")), Instant::now());
        assert!(other.is_empty());

        let commands = session.handle_event(OximeterEvent::Found(candidate.clone()), Instant::now());
        assert_eq!(
            commands,
            vec![OximeterCommand::StopScan, OximeterCommand::Connect(candidate)]
        );
    }

    #[test]
    fn test_auto_connect_only_before_first_connection() {
        let mut session = remembered();
        let now = Instant::now();
        session.handle_event(OximeterEvent::Connected(device()), now);
        session.handle_event(OximeterEvent::Disconnected(device()), now);

        let commands = session.handle_event(OximeterEvent::Found(Candidate::new("iF-Oxi", ADDR)), now);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_handshake_waits_for_delay() {
        let mut session = SessionController::new(SessionConfig {
            display_mode: Some(DisplayMode::PrSpo2),
            ..SessionConfig::default()
        });
        let start = Instant::now();
        session.handle_event(OximeterEvent::Connected(device()), start);

        assert!(session.tick(start + Duration::from_millis(1999)).is_empty());

        let commands = session.tick(start + Duration::from_secs(2));
        let frames: Vec<Vec<u8>> = commands
            .into_iter()
            .map(|c| match c {
                OximeterCommand::Send(d, frame) => {
                    assert!(d.is_same(&device()));
                    frame
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(frames[0], vec![0x55, 0xaa, 0x04, 0xb1, 0x00, 0x00, 0xb5]);
        assert_eq!(Packet::decode(&frames[1]).payload_type(), PayloadType::Mac);
        assert_eq!(Packet::decode(&frames[2]).payload, Payload::Display(vec![0x01]));

        assert!(session.tick(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_handshake_cancelled_by_disconnect() {
        let mut session = SessionController::new(SessionConfig::default());
        let start = Instant::now();
        session.handle_event(OximeterEvent::Connected(device()), start);
        session.handle_event(OximeterEvent::Disconnected(device()), start);

        let commands = session.tick(start + Duration::from_secs(2));
        assert!(!commands.iter().any(|c| matches!(c, OximeterCommand::Send(..))));
    }

    #[test]
    fn test_disconnect_schedules_rescan() {
        let mut session = SessionController::new(SessionConfig::default());
        let start = Instant::now();
        session.handle_event(OximeterEvent::Connected(device()), start);
        session.handle_event(OximeterEvent::Disconnected(device()), start);
        assert!(session.connected().is_none());

        assert!(session.tick(start + Duration::from_millis(2999)).is_empty());
        assert_eq!(
            session.tick(start + Duration::from_secs(3)),
            vec![OximeterCommand::StartScan("if".into())]
        );
        assert!(session.tick(start + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn test_received_payloads_update_state() {
        let mut session = SessionController::new(SessionConfig::default());
        let now = Instant::now();
        session.handle_event(OximeterEvent::Connected(device()), now);

        let reading = [0x10, 0x20, 0x03, 0, 0, 0, 0, 98, 0xa0, 0x01, 90, 12, 72, 30, 4];
        let packets = [
            Packet::response(PayloadType::Auth, vec![0x00]),
            Packet::response(PayloadType::Mac, vec![1, 2, 3, 4, 5, 6]),
            Packet::response(PayloadType::Reading, reading.to_vec()),
        ];
        for packet in packets {
            session.handle_event(OximeterEvent::Received(device(), packet), now);
        }

        assert_eq!(session.authenticated(), Some(true));
        assert_eq!(session.device_mac().unwrap().to_string(), "01:02:03:04:05:06");
        let latest = session.latest_reading().unwrap();
        assert_eq!((latest.spo2, latest.pr, latest.sample_index), (98, 72, 4));
    }

    #[test]
    fn test_remember_connected() {
        let mut session = SessionController::new(SessionConfig::default());
        assert_eq!(session.remember_connected(), None);

        session.handle_event(OximeterEvent::Connected(device()), Instant::now());
        assert_eq!(session.remember_connected(), Some(ADDR.to_string()));
        assert!(session.is_remembered(ADDR));

        session.forget_remembered();
        assert!(!session.is_remembered(ADDR));
    }

    #[test]
    fn test_errors_are_kept() {
        let mut session = SessionController::new(SessionConfig::default());
        session.handle_event(OximeterEvent::Error("no services".into()), Instant::now());
        assert_eq!(session.last_error(), Some("no services"));
    }
}
