use crate::infrastructure::bluetooth::protocol::{
    normalize_uuid, Packet, COMMAND_UUID, NOTIFY_UUID_END, NOTIFY_UUID_START,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scanned device that has not been connected yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    /// Platform device identifier, not necessarily a MAC
    pub address: String,
}

impl Candidate {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unknown"
        } else {
            &self.name
        }
    }

    /// Platform ids such as `BluetoothLE#BluetoothLE00:11-aa:bb:...` are
    /// shortened to the trailing address segment.
    pub fn display_address(&self) -> &str {
        if self.address.contains('#') {
            self.address.rsplit('-').next().unwrap_or(&self.address)
        } else {
            &self.address
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.display_address())
    }
}

/// A connected candidate together with its negotiated GATT topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub address: String,
    pub service_uuid: String,
    pub command_characteristic: String,
    notify_characteristics: Vec<String>,
}

impl Device {
    /// Build the device for `candidate` using the service that exposed the
    /// command characteristic. Derived UUIDs follow the brace convention of
    /// `service_uuid`.
    pub fn from_candidate(candidate: &Candidate, service_uuid: &str) -> Self {
        let braced = service_uuid.contains('{');
        let style = |uuid: &str| {
            if braced {
                format!("{{{uuid}}}")
            } else {
                uuid.to_string()
            }
        };

        Self {
            name: candidate.name.clone(),
            address: candidate.address.clone(),
            service_uuid: service_uuid.to_string(),
            command_characteristic: style(COMMAND_UUID),
            notify_characteristics: notify_uuids().iter().map(|u| style(u.as_str())).collect(),
        }
    }

    pub fn notify_characteristics(&self) -> &[String] {
        &self.notify_characteristics
    }

    pub fn is_same(&self, other: &Device) -> bool {
        self.address == other.address
    }
}

/// Notify UUIDs from [`NOTIFY_UUID_START`] through [`NOTIFY_UUID_END`],
/// incrementing the final hex digit.
pub fn notify_uuids() -> Vec<String> {
    let (prefix, start) = NOTIFY_UUID_START.split_at(NOTIFY_UUID_START.len() - 1);
    let (_, end) = NOTIFY_UUID_END.split_at(NOTIFY_UUID_END.len() - 1);
    // Both are compile-time constants ending in a hex digit.
    let start = u8::from_str_radix(start, 16).unwrap_or(0);
    let end = u8::from_str_radix(end, 16).unwrap_or(start);

    (start..=end).map(|digit| format!("{prefix}{digit:x}")).collect()
}

/// True when `uuid` names the command characteristic, in any case or brace style
pub fn is_command_uuid(uuid: &str) -> bool {
    normalize_uuid(uuid) == COMMAND_UUID
}

/// Connection lifecycle of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ScanningDevices,
    ScanningServices,
    ScanningCharacteristics,
    Streaming,
}

/// Events delivered from the worker to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum OximeterEvent {
    Found(Candidate),
    Connected(Device),
    Disconnected(Device),
    Received(Device, Packet),
    Error(String),
}

/// Commands submitted by the caller to the worker
#[derive(Debug, Clone, PartialEq)]
pub enum OximeterCommand {
    StartScan(String),
    StopScan,
    Connect(Candidate),
    /// Raw frame bytes for the command characteristic
    Send(Device, Vec<u8>),
    Disconnect(Device),
}

impl OximeterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartScan(_) => "StartScan",
            Self::StopScan => "StopScan",
            Self::Connect(_) => "Connect",
            Self::Send(..) => "Send",
            Self::Disconnect(_) => "Disconnect",
        }
    }
}
