//! Push-form Transport Adapter
//!
//! Callback-driven BLE stacks report discoveries and notifications whenever
//! they happen. [`PushTransport`] buffers those reports in a [`PushSink`] and
//! hands them out through the polling [`BleTransport`] contract, so the same
//! state machine drives both kinds of stack.

use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicInfo, CharacteristicTarget, DeviceUpdate, Notification, ScanStatus,
    TransportError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operations a callback-driven BLE stack must offer. Results of the
/// enumeration calls are reported later through the backend's [`PushSink`].
pub trait CallbackBackend {
    fn start_scan(&mut self);
    fn stop_scan(&mut self);
    fn discover_services(&mut self, device_address: &str);
    fn discover_characteristics(&mut self, device_address: &str, service_uuid: &str);
    fn subscribe(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError>;
    fn write(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError>;
    fn disconnect(&mut self, device_address: &str);
    fn close(&mut self);
}

#[derive(Debug, Default)]
struct Buffers {
    devices: VecDeque<ScanStatus<DeviceUpdate>>,
    services: VecDeque<ScanStatus<String>>,
    characteristics: VecDeque<ScanStatus<CharacteristicInfo>>,
    notifications: VecDeque<Notification>,
    link_lost: VecDeque<String>,
    last_error: Option<String>,
}

/// Cloneable handle a backend reports into, from any thread
#[derive(Debug, Clone, Default)]
pub struct PushSink {
    buffers: Arc<Mutex<Buffers>>,
}

impl PushSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, update: DeviceUpdate) {
        self.lock().devices.push_back(ScanStatus::Available(update));
    }

    pub fn device_scan_finished(&self) {
        self.lock().devices.push_back(ScanStatus::Finished);
    }

    pub fn service(&self, uuid: impl Into<String>) {
        self.lock()
            .services
            .push_back(ScanStatus::Available(uuid.into()));
    }

    pub fn services_finished(&self) {
        self.lock().services.push_back(ScanStatus::Finished);
    }

    pub fn characteristic(&self, info: CharacteristicInfo) {
        self.lock()
            .characteristics
            .push_back(ScanStatus::Available(info));
    }

    pub fn characteristics_finished(&self) {
        self.lock().characteristics.push_back(ScanStatus::Finished);
    }

    pub fn notification(&self, notification: Notification) {
        self.lock().notifications.push_back(notification);
    }

    pub fn link_lost(&self, device_address: impl Into<String>) {
        self.lock().link_lost.push_back(device_address.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PushTransport<B: CallbackBackend> {
    backend: B,
    sink: PushSink,
}

impl<B: CallbackBackend> PushTransport<B> {
    /// Build the backend around a fresh sink and wrap it
    pub fn with_backend(build: impl FnOnce(PushSink) -> B) -> Self {
        let sink = PushSink::new();
        let backend = build(sink.clone());
        Self { backend, sink }
    }

    /// Like [`PushTransport::with_backend`] for backends that can fail to start
    pub fn try_with_backend<E>(build: impl FnOnce(PushSink) -> Result<B, E>) -> Result<Self, E> {
        let sink = PushSink::new();
        let backend = build(sink.clone())?;
        Ok(Self { backend, sink })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn record(&self, result: Result<(), TransportError>) -> Result<(), TransportError> {
        if let Err(e) = &result {
            self.sink.error(e.to_string());
        }
        result
    }
}

impl<B: CallbackBackend> BleTransport for PushTransport<B> {
    fn start_device_scan(&mut self) {
        self.sink.lock().devices.clear();
        self.backend.start_scan();
    }

    fn stop_device_scan(&mut self) {
        self.backend.stop_scan();
    }

    fn poll_device(&mut self) -> ScanStatus<DeviceUpdate> {
        self.sink
            .lock()
            .devices
            .pop_front()
            .unwrap_or(ScanStatus::Processing)
    }

    fn scan_services(&mut self, device_address: &str) {
        {
            let mut buffers = self.sink.lock();
            buffers.services.clear();
            buffers.last_error = None;
        }
        self.backend.discover_services(device_address);
    }

    fn poll_service(&mut self) -> ScanStatus<String> {
        self.sink
            .lock()
            .services
            .pop_front()
            .unwrap_or(ScanStatus::Processing)
    }

    fn scan_characteristics(&mut self, device_address: &str, service_uuid: &str) {
        self.sink.lock().characteristics.clear();
        self.backend
            .discover_characteristics(device_address, service_uuid);
    }

    fn poll_characteristic(&mut self) -> ScanStatus<CharacteristicInfo> {
        self.sink
            .lock()
            .characteristics
            .pop_front()
            .unwrap_or(ScanStatus::Processing)
    }

    fn subscribe_characteristic(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        let result = self.backend.subscribe(target);
        self.record(result)
    }

    fn poll_data(&mut self) -> Option<Notification> {
        self.sink.lock().notifications.pop_front()
    }

    fn send_data(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        let result = self.backend.write(target, bytes);
        self.record(result)
    }

    fn poll_link_lost(&mut self) -> Option<String> {
        self.sink.lock().link_lost.pop_front()
    }

    fn last_error(&self) -> Option<String> {
        self.sink.lock().last_error.clone()
    }

    fn shutdown_device(&mut self, device_address: &str) {
        self.backend.disconnect(device_address);
        let mut buffers = self.sink.lock();
        buffers.notifications.retain(|n| n.device_address != device_address);
        buffers.link_lost.retain(|a| a != device_address);
    }

    fn shutdown(&mut self) {
        self.backend.close();
    }
}
