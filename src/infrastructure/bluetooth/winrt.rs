//! WinRT BLE Backend
//!
//! Callback backend over the Windows Bluetooth LE APIs. All WinRT calls run
//! on a dedicated thread hosting a tokio current-thread runtime; the worker
//! thread talks to it through a request channel and only blocks for the
//! calls whose result it needs (subscribe and write).

use crate::infrastructure::bluetooth::protocol::{normalize_uuid, MacAddress};
use crate::infrastructure::bluetooth::push::{CallbackBackend, PushSink};
use crate::infrastructure::bluetooth::transport::{
    within, CharacteristicInfo, CharacteristicTarget, DeviceUpdate, Notification, TransportError,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Native(e.message().to_string())
    }
}

/// Format a GUID the way the platform prints it: braced, lowercase
pub fn format_guid(guid: &GUID) -> String {
    let d = guid.data4;
    format!(
        "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
        guid.data1, guid.data2, guid.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
    )
}

/// Upper bound for any single GATT round trip
const GATT_TIMEOUT: Duration = Duration::from_secs(10);

type Reply = oneshot::Sender<Result<(), TransportError>>;

enum Request {
    StartScan,
    StopScan,
    DiscoverServices(String),
    DiscoverCharacteristics(String, String),
    Subscribe(CharacteristicTarget, Reply),
    Write(CharacteristicTarget, Vec<u8>, Reply),
    Disconnect(String),
    Close,
}

pub struct WinRtBackend {
    requests: mpsc::UnboundedSender<Request>,
    runtime_thread: Option<JoinHandle<()>>,
}

impl WinRtBackend {
    /// Start the runtime thread reporting into `sink`
    pub fn start(sink: PushSink) -> Result<Self> {
        let (requests, receiver) = mpsc::unbounded_channel();

        let runtime_thread = thread::Builder::new()
            .name("winrt-ble".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime for Bluetooth: {}", e);
                        sink.error(format!("runtime: {}", e));
                        return;
                    }
                };
                rt.block_on(async move {
                    let mut session = WinRtSession::new(sink);
                    session.run(receiver).await;
                });
            })
            .context("Failed to spawn WinRT Bluetooth thread")?;

        Ok(Self {
            requests,
            runtime_thread: Some(runtime_thread),
        })
    }

    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("WinRT Bluetooth thread is gone, request dropped");
        }
    }

    fn request_blocking(
        &self,
        build: impl FnOnce(Reply) -> Request,
    ) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        let stopped = || TransportError::Unavailable("WinRT Bluetooth thread stopped".to_string());
        self.requests.send(build(reply)).map_err(|_| stopped())?;
        response.blocking_recv().map_err(|_| stopped())?
    }
}

impl CallbackBackend for WinRtBackend {
    fn start_scan(&mut self) {
        self.request(Request::StartScan);
    }

    fn stop_scan(&mut self) {
        self.request(Request::StopScan);
    }

    fn discover_services(&mut self, device_address: &str) {
        self.request(Request::DiscoverServices(device_address.to_string()));
    }

    fn discover_characteristics(&mut self, device_address: &str, service_uuid: &str) {
        self.request(Request::DiscoverCharacteristics(
            device_address.to_string(),
            service_uuid.to_string(),
        ));
    }

    fn subscribe(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        let target = target.clone();
        self.request_blocking(|reply| Request::Subscribe(target, reply))
    }

    fn write(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        let target = target.clone();
        let bytes = bytes.to_vec();
        self.request_blocking(|reply| Request::Write(target, bytes, reply))
    }

    fn disconnect(&mut self, device_address: &str) {
        self.request(Request::Disconnect(device_address.to_string()));
    }

    fn close(&mut self) {
        if let Some(handle) = self.runtime_thread.take() {
            self.request(Request::Close);
            if handle.join().is_err() {
                error!("WinRT Bluetooth thread panicked");
            }
        }
    }
}

impl Drop for WinRtBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Characteristic key: address plus normalized service and characteristic UUIDs
type CharKey = (String, String, String);

fn char_key(target: &CharacteristicTarget) -> CharKey {
    (
        target.device_address.clone(),
        normalize_uuid(&target.service_uuid),
        normalize_uuid(&target.characteristic_uuid),
    )
}

struct WinRtSession {
    sink: PushSink,
    watcher: Option<(BluetoothLEAdvertisementWatcher, i64)>,
    devices: HashMap<String, BluetoothLEDevice>,
    status_tokens: HashMap<String, i64>,
    services: HashMap<(String, String), GattDeviceService>,
    characteristics: HashMap<CharKey, (GattCharacteristic, Option<i64>)>,
}

impl WinRtSession {
    fn new(sink: PushSink) -> Self {
        Self {
            sink,
            watcher: None,
            devices: HashMap::new(),
            status_tokens: HashMap::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
        }
    }

    async fn run(&mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        info!("WinRT Bluetooth session started");
        while let Some(request) = requests.recv().await {
            match request {
                Request::StartScan => {
                    if let Err(e) = self.start_scan() {
                        error!("Failed to start advertisement watcher: {}", e);
                        self.sink.error(e.message().to_string());
                    }
                }
                Request::StopScan => self.stop_scan(),
                Request::DiscoverServices(address) => {
                    if let Err(e) = self.discover_services(&address).await {
                        warn!("Service discovery on {} failed: {}", address, e);
                        self.sink.error(e.to_string());
                    }
                    self.sink.services_finished();
                }
                Request::DiscoverCharacteristics(address, service) => {
                    if let Err(e) = self.discover_characteristics(&address, &service).await {
                        warn!("Characteristic discovery on {} failed: {}", service, e);
                        self.sink.error(e.to_string());
                    }
                    self.sink.characteristics_finished();
                }
                Request::Subscribe(target, reply) => {
                    let _ = reply.send(self.subscribe(&target).await);
                }
                Request::Write(target, bytes, reply) => {
                    let _ = reply.send(self.write(&target, &bytes).await);
                }
                Request::Disconnect(address) => self.disconnect(&address),
                Request::Close => break,
            }
        }
        self.close();
        info!("WinRT Bluetooth session stopped");
    }

    fn start_scan(&mut self) -> windows::core::Result<()> {
        self.stop_scan();
        info!("Starting BLE advertisement watcher");

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sink = self.sink.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = MacAddress::from_u64(args.BluetoothAddress()?).to_string();
                    let is_connectable = args.IsConnectable().unwrap_or(false);

                    sink.device(DeviceUpdate {
                        id: address,
                        name_updated: !name.is_empty(),
                        name: (!name.is_empty()).then_some(name),
                        is_connectable,
                        connectable_updated: true,
                    });
                }
                Ok(())
            },
        );
        watcher.Received(&handler)?;

        // The OS may stop the watcher on its own (radio off, too many watchers)
        let sink = self.sink.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  _: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                sink.device_scan_finished();
                Ok(())
            },
        );
        let stopped_token = watcher.Stopped(&stopped)?;

        watcher.Start()?;
        self.watcher = Some((watcher, stopped_token));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some((watcher, stopped_token)) = self.watcher.take() {
            info!("Stopping BLE advertisement watcher");
            let _ = watcher.RemoveStopped(stopped_token);
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop watcher: {}", e);
            }
        }
    }

    async fn device(&mut self, address: &str) -> Result<BluetoothLEDevice, TransportError> {
        if let Some(device) = self.devices.get(address) {
            return Ok(device.clone());
        }
        let raw = address
            .parse::<MacAddress>()
            .map_err(|_| TransportError::UnknownTarget(address.to_string()))?
            .to_u64();
        info!("Opening Bluetooth device {}", address);
        let device = within(GATT_TIMEOUT, BluetoothLEDevice::FromBluetoothAddressAsync(raw)?).await?;
        self.devices.insert(address.to_string(), device.clone());
        Ok(device)
    }

    async fn discover_services(&mut self, address: &str) -> Result<(), TransportError> {
        let device = self.device(address).await?;
        let result = within(GATT_TIMEOUT, device.GetGattServicesAsync()?).await?;

        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Native(format!("GATT services: {:?}", status)));
        }

        let services = result.Services()?;
        debug!("Found {} services on {}", services.Size()?, address);
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let uuid = format_guid(&service.Uuid()?);
            self.services
                .insert((address.to_string(), normalize_uuid(&uuid)), service);
            self.sink.service(uuid);
        }
        Ok(())
    }

    async fn discover_characteristics(&mut self, address: &str, service_uuid: &str) -> Result<(), TransportError> {
        let key = (address.to_string(), normalize_uuid(service_uuid));
        let service = self
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::UnknownTarget(service_uuid.to_string()))?;

        let result = within(GATT_TIMEOUT, service.GetCharacteristicsAsync()?).await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Native(format!("GATT characteristics: {:?}", status)));
        }

        let characteristics = result.Characteristics()?;
        for i in 0..characteristics.Size()? {
            let characteristic = characteristics.GetAt(i)?;
            let uuid = format_guid(&characteristic.Uuid()?);
            let user_description = characteristic
                .UserDescription()
                .map(|d| d.to_string())
                .unwrap_or_default();

            self.characteristics.insert(
                (key.0.clone(), key.1.clone(), normalize_uuid(&uuid)),
                (characteristic, None),
            );
            self.sink.characteristic(CharacteristicInfo {
                uuid,
                user_description,
            });
        }
        Ok(())
    }

    async fn subscribe(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        let key = char_key(target);
        let (characteristic, _) = self
            .characteristics
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::UnknownTarget(target.characteristic_uuid.clone()))?;

        let status = within(
            GATT_TIMEOUT,
            characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?,
        )
        .await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Native(format!("subscribe status: {:?}", status)));
        }

        let sink = self.sink.clone();
        let notify_target = target.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&value)?;
                    let mut data = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut data)?;
                    sink.notification(Notification {
                        device_address: notify_target.device_address.clone(),
                        service_uuid: notify_target.service_uuid.clone(),
                        characteristic_uuid: notify_target.characteristic_uuid.clone(),
                        data,
                    });
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler)?;
        self.characteristics.insert(key, (characteristic, Some(token)));

        self.watch_connection(&target.device_address)?;
        Ok(())
    }

    /// Report link loss once the device is in use
    fn watch_connection(&mut self, address: &str) -> Result<(), TransportError> {
        if self.status_tokens.contains_key(address) {
            return Ok(());
        }
        let Some(device) = self.devices.get(address) else {
            return Ok(());
        };

        let sink = self.sink.clone();
        let watched = address.to_string();
        let token = device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        sink.link_lost(watched.clone());
                    }
                }
                Ok(())
            },
        ))?;
        self.status_tokens.insert(address.to_string(), token);
        Ok(())
    }

    async fn write(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        let (characteristic, _) = self
            .characteristics
            .get(&char_key(target))
            .cloned()
            .ok_or_else(|| TransportError::UnknownTarget(target.characteristic_uuid.clone()))?;

        let writer = DataWriter::new()?;
        writer.WriteBytes(bytes)?;
        let buffer = writer.DetachBuffer()?;

        let status = within(GATT_TIMEOUT, characteristic.WriteValueAsync(&buffer)?).await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Native(format!("write status: {:?}", status)));
        }
        Ok(())
    }

    fn disconnect(&mut self, address: &str) {
        info!("Releasing Bluetooth device {}", address);
        self.characteristics.retain(|(owner, _, _), (characteristic, token)| {
            if owner != address {
                return true;
            }
            if let Some(token) = token.take() {
                let _ = characteristic.RemoveValueChanged(token);
            }
            false
        });
        self.services.retain(|(owner, _), service| {
            if owner != address {
                return true;
            }
            let _ = service.Close();
            false
        });
        if let Some(device) = self.devices.remove(address) {
            if let Some(token) = self.status_tokens.remove(address) {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            let _ = device.Close();
        }
    }

    fn close(&mut self) {
        self.stop_scan();
        let addresses: Vec<String> = self.devices.keys().cloned().collect();
        for address in addresses {
            self.disconnect(&address);
        }
    }
}
