//! Simulated Oximeter
//!
//! A [`CallbackBackend`] that behaves like a single pulse oximeter in range:
//! it advertises itself next to an unrelated device, exposes the vendor GATT
//! service behind a generic one, answers host commands and streams readings
//! once authenticated.

use crate::infrastructure::bluetooth::protocol::{
    normalize_uuid, Packet, Payload, PayloadType, Reading, COMMAND_UUID, MAC_LEN,
};
use crate::infrastructure::bluetooth::push::{CallbackBackend, PushSink, PushTransport};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicInfo, CharacteristicTarget, DeviceUpdate, Notification, TransportError,
};
use crate::domain::models::notify_uuids;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub const SIM_GENERIC_SERVICE: &str = "{00001800-0000-1000-8000-00805f9b34fb}";
pub const SIM_OXIMETER_SERVICE: &str = "{0000fff0-0000-1000-8000-00805f9b34fb}";
const SIM_DEVICE_NAME_CHAR: &str = "{00002a00-0000-1000-8000-00805f9b34fb}";

/// Auth reply byte for an accepted password
pub const AUTH_ACCEPTED: u8 = 0x00;
pub const AUTH_REJECTED: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub device_name: String,
    pub device_address: String,
    pub mac: [u8; MAC_LEN],
    pub password: [u8; 2],
    pub sample_interval: Duration,
    /// Stop streaming silently after this many readings
    pub stall_after: Option<u32>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            device_name: "iF-Sim Oximeter".to_string(),
            device_address: "sim:c0:ff:ee:00:01".to_string(),
            mac: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x01],
            password: [0x00, 0x00],
            sample_interval: Duration::from_millis(250),
            stall_after: None,
        }
    }
}

pub struct SimulatedOximeter {
    options: SimulatorOptions,
    sink: PushSink,
    connected: bool,
    subscribed: Vec<String>,
    streaming: Option<StreamHandle>,
}

/// Running sample stream: liveness flag, stop signal and its thread
struct StreamHandle {
    running: Arc<AtomicBool>,
    stop: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl SimulatedOximeter {
    pub fn new(options: SimulatorOptions, sink: PushSink) -> Self {
        Self {
            options,
            sink,
            connected: false,
            subscribed: Vec::new(),
            streaming: None,
        }
    }

    /// Wrap a simulator in the polling transport contract
    pub fn transport(options: SimulatorOptions) -> PushTransport<Self> {
        PushTransport::with_backend(|sink| Self::new(options, sink))
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
            .as_ref()
            .is_some_and(|stream| stream.running.load(Ordering::Acquire))
    }

    fn check_device(&self, device_address: &str) -> Result<(), TransportError> {
        if device_address == self.options.device_address {
            Ok(())
        } else {
            Err(TransportError::UnknownTarget(device_address.to_string()))
        }
    }

    /// Replies go out on the first subscribed notify characteristic
    fn reply(&self, packet: Packet) {
        let Some(characteristic) = self.subscribed.first() else {
            debug!("Simulator has no subscriber for {:?}", packet.payload_type());
            return;
        };
        match packet.encode() {
            Ok(data) => self.sink.notification(Notification {
                device_address: self.options.device_address.clone(),
                service_uuid: SIM_OXIMETER_SERVICE.to_string(),
                characteristic_uuid: characteristic.clone(),
                data,
            }),
            Err(e) => error!("Simulator failed to encode reply: {}", e),
        }
    }

    fn handle_command(&mut self, packet: Packet) {
        match packet.payload {
            Payload::Auth(password) => {
                if password.as_slice() == self.options.password {
                    info!("Simulator accepted auth");
                    self.reply(Packet::response(PayloadType::Auth, vec![AUTH_ACCEPTED]));
                    self.start_streaming();
                } else {
                    warn!("Simulator rejected auth {:02X?}", password);
                    self.reply(Packet::response(PayloadType::Auth, vec![AUTH_REJECTED]));
                }
            }
            Payload::Mac(_) => {
                self.reply(Packet::response(PayloadType::Mac, self.options.mac.to_vec()));
            }
            Payload::Display(mode) => {
                self.reply(Packet::response(PayloadType::Display, mode));
            }
            other => debug!("Simulator ignores {:?}", other.payload_type()),
        }
    }

    fn start_streaming(&mut self) {
        if self.is_streaming() {
            return;
        }
        let Some(characteristic) = self.subscribed.first().cloned() else {
            return;
        };

        let running = Arc::new(AtomicBool::new(true));
        let (stop, stopped) = oneshot::channel();
        let stream = SampleStream {
            sink: self.sink.clone(),
            running: Arc::clone(&running),
            stop: stopped,
            device_address: self.options.device_address.clone(),
            characteristic,
            interval: self.options.sample_interval,
            stall_after: self.options.stall_after,
        };

        match thread::Builder::new()
            .name("oximeter-sim".to_string())
            .spawn(move || stream.run())
        {
            Ok(thread) => {
                self.streaming = Some(StreamHandle {
                    running,
                    stop,
                    thread,
                })
            }
            Err(e) => {
                error!("Failed to start simulator stream: {}", e);
                self.sink.error(format!("simulator stream: {}", e));
            }
        }
    }

    fn stop_streaming(&mut self) {
        if let Some(stream) = self.streaming.take() {
            stream.running.store(false, Ordering::Release);
            // Already gone if the stream stalled on its own
            let _ = stream.stop.send(());
            if stream.thread.join().is_err() {
                error!("Simulator stream thread panicked");
            }
        }
    }
}

impl CallbackBackend for SimulatedOximeter {
    fn start_scan(&mut self) {
        self.sink.device(DeviceUpdate {
            id: "sim:12:34:56:78:9a:bc".to_string(),
            name: Some("Desk Lamp".to_string()),
            is_connectable: true,
            connectable_updated: true,
            name_updated: true,
        });
        self.sink.device(DeviceUpdate {
            id: self.options.device_address.clone(),
            name: Some(self.options.device_name.clone()),
            is_connectable: true,
            connectable_updated: true,
            name_updated: true,
        });
    }

    fn stop_scan(&mut self) {}

    fn discover_services(&mut self, device_address: &str) {
        if let Err(e) = self.check_device(device_address) {
            self.sink.error(e.to_string());
            self.sink.services_finished();
            return;
        }
        self.connected = true;
        self.sink.service(SIM_GENERIC_SERVICE);
        self.sink.service(SIM_OXIMETER_SERVICE);
        self.sink.services_finished();
    }

    fn discover_characteristics(&mut self, device_address: &str, service_uuid: &str) {
        if self.check_device(device_address).is_ok() {
            let uuids: Vec<String> = match service_uuid {
                SIM_GENERIC_SERVICE => vec![SIM_DEVICE_NAME_CHAR.to_string()],
                SIM_OXIMETER_SERVICE => std::iter::once(COMMAND_UUID.to_string())
                    .chain(notify_uuids())
                    .map(|u| format!("{{{}}}", u))
                    .collect(),
                _ => Vec::new(),
            };
            for uuid in uuids {
                self.sink.characteristic(CharacteristicInfo {
                    uuid,
                    user_description: String::new(),
                });
            }
        }
        self.sink.characteristics_finished();
    }

    fn subscribe(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        self.check_device(&target.device_address)?;
        if !self.connected {
            return Err(TransportError::Unavailable("not connected".to_string()));
        }
        let known = notify_uuids()
            .iter()
            .any(|u| *u == normalize_uuid(&target.characteristic_uuid));
        if !known {
            return Err(TransportError::UnknownTarget(target.characteristic_uuid.clone()));
        }
        if !self.subscribed.contains(&target.characteristic_uuid) {
            self.subscribed.push(target.characteristic_uuid.clone());
        }
        Ok(())
    }

    fn write(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_device(&target.device_address)?;
        if !self.connected {
            return Err(TransportError::Unavailable("not connected".to_string()));
        }
        if normalize_uuid(&target.characteristic_uuid) != COMMAND_UUID {
            return Err(TransportError::UnknownTarget(target.characteristic_uuid.clone()));
        }

        let packet = Packet::decode(bytes);
        if !packet.is_host() || !packet.checksum_ok {
            warn!("Simulator ignores malformed command {:02X?}", bytes);
            return Ok(());
        }
        self.handle_command(packet);
        Ok(())
    }

    fn disconnect(&mut self, device_address: &str) {
        if device_address == self.options.device_address {
            info!("Simulator disconnected");
            self.stop_streaming();
            self.connected = false;
            self.subscribed.clear();
        }
    }

    fn close(&mut self) {
        self.stop_streaming();
        self.connected = false;
    }
}

impl Drop for SimulatedOximeter {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

/// Background producer of reading notifications
struct SampleStream {
    sink: PushSink,
    running: Arc<AtomicBool>,
    stop: oneshot::Receiver<()>,
    device_address: String,
    characteristic: String,
    interval: Duration,
    stall_after: Option<u32>,
}

impl SampleStream {
    fn run(self) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create simulator runtime: {}", e);
                return;
            }
        };

        rt.block_on(async move {
            let mut stop = self.stop;
            let mut ticker = tokio::time::interval(self.interval);
            let mut sent = 0u32;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop => break,
                }
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                if self.stall_after.is_some_and(|limit| sent >= limit) {
                    info!("Simulator stalling after {} samples", sent);
                    break;
                }

                let packet = Packet::response(PayloadType::Reading, sample(sent).to_bytes().to_vec());
                match packet.encode() {
                    Ok(data) => self.sink.notification(Notification {
                        device_address: self.device_address.clone(),
                        service_uuid: SIM_OXIMETER_SERVICE.to_string(),
                        characteristic_uuid: self.characteristic.clone(),
                        data,
                    }),
                    Err(e) => error!("Simulator failed to encode reading: {}", e),
                }
                sent += 1;
            }
        });
    }
}

/// Plausible resting values with a little beat-to-beat variation
pub fn sample(index: u32) -> Reading {
    let pr = 66 + (index % 7) as u8;
    // RR interval travels in 2 ms units
    let rr_interval = (60_000 / pr as u32 / 2) as u16;
    let phase = index % 16;
    Reading {
        ir1: 0x01_8000 + phase * 0x0400,
        ir2: 0x01_2000 + phase * 0x0300,
        status: 0,
        spo2: 96 + (index % 3) as u8,
        rr_interval,
        battery: 87,
        pi: 28 + (index % 5) as u8,
        pr,
        sdnn: 42,
        sample_index: index as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::{BleTransport, ScanStatus};
    use std::time::Instant;

    fn options() -> SimulatorOptions {
        SimulatorOptions {
            sample_interval: Duration::from_millis(5),
            ..SimulatorOptions::default()
        }
    }

    fn command_target(opts: &SimulatorOptions) -> CharacteristicTarget {
        CharacteristicTarget {
            device_address: opts.device_address.clone(),
            service_uuid: SIM_OXIMETER_SERVICE.to_string(),
            characteristic_uuid: format!("{{{}}}", COMMAND_UUID),
        }
    }

    fn notify_target(opts: &SimulatorOptions, index: usize) -> CharacteristicTarget {
        CharacteristicTarget {
            characteristic_uuid: format!("{{{}}}", notify_uuids()[index]),
            ..command_target(opts)
        }
    }

    fn connected(opts: &SimulatorOptions) -> PushTransport<SimulatedOximeter> {
        let mut t = SimulatedOximeter::transport(opts.clone());
        t.scan_services(&opts.device_address);
        for i in 0..8 {
            t.subscribe_characteristic(&notify_target(opts, i)).unwrap();
        }
        t
    }

    fn wait_for_data(t: &mut PushTransport<SimulatedOximeter>) -> Option<Packet> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(n) = t.poll_data() {
                return Some(Packet::decode(&n.data));
            }
            thread::sleep(Duration::from_millis(2));
        }
        None
    }

    #[test]
    fn test_scan_advertises_oximeter_and_noise() {
        let mut t = SimulatedOximeter::transport(options());
        t.start_device_scan();
        let mut names = Vec::new();
        while let ScanStatus::Available(update) = t.poll_device() {
            names.extend(update.name);
        }
        assert_eq!(names, vec!["Desk Lamp".to_string(), "iF-Sim Oximeter".to_string()]);
    }

    #[test]
    fn test_gatt_topology_is_braced() {
        let opts = options();
        let mut t = SimulatedOximeter::transport(opts.clone());
        t.scan_services(&opts.device_address);
        assert_eq!(t.poll_service(), ScanStatus::Available(SIM_GENERIC_SERVICE.to_string()));
        assert_eq!(t.poll_service(), ScanStatus::Available(SIM_OXIMETER_SERVICE.to_string()));
        assert_eq!(t.poll_service(), ScanStatus::Finished);

        t.scan_characteristics(&opts.device_address, SIM_OXIMETER_SERVICE);
        let mut uuids = Vec::new();
        while let ScanStatus::Available(c) = t.poll_characteristic() {
            uuids.push(c.uuid);
        }
        assert_eq!(uuids.len(), 9);
        assert!(uuids.iter().all(|u| u.starts_with('{') && u.ends_with('}')));
    }

    #[test]
    fn test_unknown_device_has_no_services() {
        let mut t = SimulatedOximeter::transport(options());
        t.scan_services("nobody");
        assert_eq!(t.poll_service(), ScanStatus::Finished);
        assert!(t.last_error().is_some());
    }

    #[test]
    fn test_auth_then_readings() {
        let opts = options();
        let mut t = connected(&opts);

        let auth = Packet::auth_command([0, 0]).encode().unwrap();
        t.send_data(&command_target(&opts), &auth).unwrap();

        let reply = wait_for_data(&mut t).unwrap();
        assert_eq!(reply.payload, Payload::Auth(vec![AUTH_ACCEPTED]));
        assert!(reply.is_device());

        let reading = wait_for_data(&mut t).unwrap().reading().unwrap();
        assert_eq!(reading, sample(0));

        t.shutdown();
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let opts = options();
        let mut t = connected(&opts);

        let auth = Packet::auth_command([1, 2]).encode().unwrap();
        t.send_data(&command_target(&opts), &auth).unwrap();

        let reply = wait_for_data(&mut t).unwrap();
        assert_eq!(reply.payload, Payload::Auth(vec![AUTH_REJECTED]));
        assert!(!t.backend().is_streaming());
    }

    #[test]
    fn test_mac_request() {
        let opts = options();
        let mut t = connected(&opts);

        let request = Packet::mac_command().encode().unwrap();
        t.send_data(&command_target(&opts), &request).unwrap();

        let mac = wait_for_data(&mut t).unwrap().mac().unwrap();
        assert_eq!(mac.to_string(), "C0:FF:EE:00:00:01");
    }

    #[test]
    fn test_write_to_notify_characteristic_fails() {
        let opts = options();
        let mut t = connected(&opts);
        assert!(t.send_data(&notify_target(&opts, 0), &[0]).is_err());
    }

    #[test]
    fn test_stall_after_limit() {
        let opts = SimulatorOptions {
            stall_after: Some(2),
            ..options()
        };
        let mut t = connected(&opts);
        let auth = Packet::auth_command([0, 0]).encode().unwrap();
        t.send_data(&command_target(&opts), &auth).unwrap();

        let mut readings = 0;
        while let Some(packet) = wait_for_data(&mut t) {
            if packet.payload_type() == PayloadType::Reading {
                readings += 1;
            }
            if readings == 2 {
                break;
            }
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(readings, 2);
        assert_eq!(t.poll_data(), None);
    }

    #[test]
    fn test_disconnect_joins_sample_stream() {
        let opts = options();
        let mut t = connected(&opts);
        let auth = Packet::auth_command([0, 0]).encode().unwrap();
        t.send_data(&command_target(&opts), &auth).unwrap();
        assert_eq!(wait_for_data(&mut t).unwrap().payload_type(), PayloadType::Auth);
        assert_eq!(wait_for_data(&mut t).unwrap().payload_type(), PayloadType::Reading);

        t.shutdown_device(&opts.device_address);
        assert!(!t.backend().is_streaming());
        assert!(t.backend().streaming.is_none());

        // The stream thread is joined, so nothing can arrive afterwards
        thread::sleep(opts.sample_interval * 10);
        assert_eq!(t.poll_data(), None);
    }

    #[test]
    fn test_sample_values_are_plausible() {
        for i in 0..32 {
            let r = sample(i);
            assert!((90..=100).contains(&r.spo2));
            assert!((r.rr_interval_ms() as i64 - 60_000 / r.pr as i64).abs() <= 2);
        }
    }
}
