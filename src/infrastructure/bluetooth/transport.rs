//! Native Transport Contract
//!
//! The polling interface the connection state machine drives. Every poll is
//! non-blocking: when nothing is ready the transport answers
//! [`ScanStatus::Processing`] or `None`.

use std::future::IntoFuture;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{0}")]
    Native(String),
    #[error("unknown target {0}")]
    UnknownTarget(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("operation timed out")]
    Timeout,
}

/// Await a native operation for at most `limit`
pub async fn within<F, T, E>(limit: Duration, operation: F) -> Result<T, TransportError>
where
    F: IntoFuture<Output = Result<T, E>>,
    E: Into<TransportError>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(Into::into)
}

/// Result of a non-blocking enumeration poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus<T> {
    /// Nothing new yet
    Processing,
    Available(T),
    /// The enumeration is complete
    Finished,
}

/// Advertisement update for one device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceUpdate {
    pub id: String,
    pub name: Option<String>,
    pub is_connectable: bool,
    pub connectable_updated: bool,
    pub name_updated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub user_description: String,
}

/// Fully qualified characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicTarget {
    pub device_address: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
}

/// Inbound notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub device_address: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub data: Vec<u8>,
}

/// Capability set the connection state machine needs from a BLE stack
pub trait BleTransport {
    fn start_device_scan(&mut self);
    fn stop_device_scan(&mut self);
    fn poll_device(&mut self) -> ScanStatus<DeviceUpdate>;

    fn scan_services(&mut self, device_address: &str);
    fn poll_service(&mut self) -> ScanStatus<String>;

    fn scan_characteristics(&mut self, device_address: &str, service_uuid: &str);
    fn poll_characteristic(&mut self) -> ScanStatus<CharacteristicInfo>;

    fn subscribe_characteristic(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError>;
    fn poll_data(&mut self) -> Option<Notification>;
    fn send_data(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError>;

    /// Address of a device whose link dropped underneath us
    fn poll_link_lost(&mut self) -> Option<String> {
        None
    }

    fn last_error(&self) -> Option<String>;

    /// Disconnect a single device
    fn shutdown_device(&mut self, device_address: &str);
    /// Release every native resource
    fn shutdown(&mut self);
}

impl<T: BleTransport + ?Sized> BleTransport for Box<T> {
    fn start_device_scan(&mut self) {
        (**self).start_device_scan()
    }
    fn stop_device_scan(&mut self) {
        (**self).stop_device_scan()
    }
    fn poll_device(&mut self) -> ScanStatus<DeviceUpdate> {
        (**self).poll_device()
    }
    fn scan_services(&mut self, device_address: &str) {
        (**self).scan_services(device_address)
    }
    fn poll_service(&mut self) -> ScanStatus<String> {
        (**self).poll_service()
    }
    fn scan_characteristics(&mut self, device_address: &str, service_uuid: &str) {
        (**self).scan_characteristics(device_address, service_uuid)
    }
    fn poll_characteristic(&mut self) -> ScanStatus<CharacteristicInfo> {
        (**self).poll_characteristic()
    }
    fn subscribe_characteristic(&mut self, target: &CharacteristicTarget) -> Result<(), TransportError> {
        (**self).subscribe_characteristic(target)
    }
    fn poll_data(&mut self) -> Option<Notification> {
        (**self).poll_data()
    }
    fn send_data(&mut self, target: &CharacteristicTarget, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send_data(target, bytes)
    }
    fn poll_link_lost(&mut self) -> Option<String> {
        (**self).poll_link_lost()
    }
    fn last_error(&self) -> Option<String> {
        (**self).last_error()
    }
    fn shutdown_device(&mut self, device_address: &str) {
        (**self).shutdown_device(device_address)
    }
    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_within_times_out_stuck_operation() {
        let stuck = std::future::pending::<Result<(), TransportError>>();
        let result = within(Duration::from_millis(20), stuck).await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_within_passes_through_results() {
        let ok = async { Ok::<_, TransportError>(7u8) };
        assert_eq!(within(Duration::from_secs(1), ok).await, Ok(7));

        let failed = async { Err::<u8, _>(TransportError::Native("GATT busy".to_string())) };
        assert_eq!(
            within(Duration::from_secs(1), failed).await,
            Err(TransportError::Native("GATT busy".to_string()))
        );
    }
}
