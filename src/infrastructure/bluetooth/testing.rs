//! Scripted in-memory transport for state machine tests.

use crate::domain::models::Device;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicInfo, CharacteristicTarget, DeviceUpdate, Notification, ScanStatus,
    TransportError,
};
use std::collections::{HashSet, VecDeque};

/// Transport call recorded by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartDeviceScan,
    StopDeviceScan,
    ScanServices(String),
    ScanCharacteristics(String, String),
    Subscribe(CharacteristicTarget),
    Send(CharacteristicTarget, Vec<u8>),
    ShutdownDevice(String),
    Shutdown,
}

/// Answers service and characteristic scans from a fixed topology and
/// everything else from hand-filled queues.
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub topology: Vec<(String, Vec<String>)>,
    pub devices: VecDeque<ScanStatus<DeviceUpdate>>,
    pub services: VecDeque<ScanStatus<String>>,
    pub characteristics: VecDeque<ScanStatus<CharacteristicInfo>>,
    pub data: VecDeque<Notification>,
    pub link_lost: VecDeque<String>,
    pub fail_subscribe: HashSet<String>,
    pub fail_send: bool,
    pub last_error: Option<String>,
    pub calls: Vec<Call>,
}

impl FakeTransport {
    pub fn with_service(mut self, service: &str, characteristics: &[&str]) -> Self {
        self.topology.push((
            service.to_string(),
            characteristics.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    /// Queue `data` as arriving on the first notify characteristic of `device`
    pub fn push_data(&mut self, device: &Device, data: Vec<u8>) {
        let characteristic = device
            .notify_characteristics()
            .first()
            .cloned()
            .unwrap_or_default();
        self.data.push_back(Notification {
            device_address: device.address.clone(),
            service_uuid: device.service_uuid.clone(),
            characteristic_uuid: characteristic,
            data,
        });
    }
}

impl BleTransport for FakeTransport {
    fn start_device_scan(&mut self) {
        self.calls.push(Call::StartDeviceScan);
    }

    fn stop_device_scan(&mut self) {
        self.calls.push(Call::StopDeviceScan);
    }

    fn poll_device(&mut self) -> ScanStatus<DeviceUpdate> {
        self.devices.pop_front().unwrap_or(ScanStatus::Processing)
    }

    fn scan_services(&mut self, device_address: &str) {
        self.calls.push(Call::ScanServices(device_address.to_string()));
        self.services = self
            .topology
            .iter()
            .map(|(service, _)| ScanStatus::Available(service.clone()))
            .chain(std::iter::once(ScanStatus::Finished))
            .collect();
    }

    fn poll_service(&mut self) -> ScanStatus<String> {
        self.services.pop_front().unwrap_or(ScanStatus::Processing)
    }

    fn scan_characteristics(&mut self, device_address: &str, service_uuid: &str) {
        self.calls.push(Call::ScanCharacteristics(
            device_address.to_string(),
            service_uuid.to_string(),
        ));
        self.characteristics = self
            .topology
            .iter()
            .filter(|(service, _)| service == service_uuid)
            .flat_map(|(_, chars)| chars.iter())
            .map(|uuid| {
                ScanStatus::Available(CharacteristicInfo {
                    uuid: uuid.clone(),
                    user_description: String::new(),
                })
            })
            .chain(std::iter::once(ScanStatus::Finished))
            .collect();
    }

    fn poll_characteristic(&mut self) -> ScanStatus<CharacteristicInfo> {
        self.characteristics
            .pop_front()
            .unwrap_or(ScanStatus::Processing)
    }

    fn subscribe_characteristic(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        self.calls.push(Call::Subscribe(target.clone()));
        if self.fail_subscribe.contains(&target.characteristic_uuid) {
            return Err(TransportError::Native("GATT unreachable".to_string()));
        }
        Ok(())
    }

    fn poll_data(&mut self) -> Option<Notification> {
        self.data.pop_front()
    }

    fn send_data(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        self.calls.push(Call::Send(target.clone(), bytes.to_vec()));
        if self.fail_send {
            return Err(TransportError::Native("write rejected".to_string()));
        }
        Ok(())
    }

    fn poll_link_lost(&mut self) -> Option<String> {
        self.link_lost.pop_front()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn shutdown_device(&mut self, device_address: &str) {
        self.calls.push(Call::ShutdownDevice(device_address.to_string()));
    }

    fn shutdown(&mut self) {
        self.calls.push(Call::Shutdown);
    }
}
