//! Pulse Oximeter Protocol
//!
//! This module contains the wire format used to talk to the oximeter:
//! GATT UUIDs, frame encoding/decoding and the typed payload views.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Command (write) characteristic UUID
pub const COMMAND_UUID: &str = "d44bc439-abfd-45a2-b575-925416129600";

/// First notify characteristic UUID. The device exposes eight notify
/// characteristics whose final hex digit runs from this one to [`NOTIFY_UUID_END`].
pub const NOTIFY_UUID_START: &str = "d44bc439-abfd-45a2-b575-925416129601";

/// Last notify characteristic UUID
pub const NOTIFY_UUID_END: &str = "d44bc439-abfd-45a2-b575-925416129608";

/// Default advertised-name prefix, matched case-insensitively
pub const DEFAULT_NAME_PREFIX: &str = "if";

/// Magic for frames sent by the host
pub const HOST_MAGIC: u16 = 0x55aa;

/// Magic for frames sent by the device
pub const DEVICE_MAGIC: u16 = 0xaa55;

/// Largest payload whose length still fits the 8-bit length byte
pub const MAX_PAYLOAD_LEN: usize = 253;

/// Fixed transmit buffer of the native transport
pub const MAX_FRAME_LEN: usize = 512;

/// Size of a `Reading` payload
pub const READING_LEN: usize = 15;

/// Size of a `MAC` payload
pub const MAC_LEN: usize = 6;

/// Bytes before the payload type: magic (2) + length (1)
const HEADER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit")]
    PayloadTooLarge(usize),
    #[error("expected a {expected:?} payload, got {actual:?}")]
    WrongPayloadType {
        expected: PayloadType,
        actual: PayloadType,
    },
    #[error("{kind:?} payload must be {expected} bytes, got {actual}")]
    WrongPayloadSize {
        kind: PayloadType,
        expected: usize,
        actual: usize,
    },
}

/// Payload type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    Auth = 0xb1,
    Reading = 0xd0,
    Mac = 0xba,
    Display = 0xbb,
    Unknown = 0xff,
}

impl PayloadType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0xb1 => Self::Auth,
            0xd0 => Self::Reading,
            0xba => Self::Mac,
            0xbb => Self::Display,
            _ => Self::Unknown,
        }
    }
}

/// Value shown on the device screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum DisplayMode {
    PrSpo2 = 0x01,
    PrRlx = 0x02,
    RmssdSpo2 = 0x03,
    SdnnSpo2 = 0x04,
}

/// Frame payload, tagged by its type byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Auth(Vec<u8>),
    Reading(Vec<u8>),
    Mac(Vec<u8>),
    Display(Vec<u8>),
    /// Unrecognized type byte, or a frame too short to carry one
    Unknown { type_byte: u8, bytes: Vec<u8> },
}

impl Payload {
    fn new(type_byte: u8, bytes: Vec<u8>) -> Self {
        match PayloadType::from_byte(type_byte) {
            PayloadType::Auth => Self::Auth(bytes),
            PayloadType::Reading => Self::Reading(bytes),
            PayloadType::Mac => Self::Mac(bytes),
            PayloadType::Display => Self::Display(bytes),
            PayloadType::Unknown => Self::Unknown { type_byte, bytes },
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Auth(_) => PayloadType::Auth,
            Self::Reading(_) => PayloadType::Reading,
            Self::Mac(_) => PayloadType::Mac,
            Self::Display(_) => PayloadType::Display,
            Self::Unknown { .. } => PayloadType::Unknown,
        }
    }

    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Unknown { type_byte, .. } => *type_byte,
            other => other.payload_type() as u8,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Auth(b) | Self::Reading(b) | Self::Mac(b) | Self::Display(b) => b,
            Self::Unknown { bytes, .. } => bytes,
        }
    }
}

/// A framed message exchanged with the device
///
/// # Frame Structure
///
/// ```text
/// [0-1]   : Magic (u16 big-endian, 0x55AA host / 0xAA55 device)
/// [2]     : Length = payload length + 2
/// [3]     : Payload type
/// [4..n]  : Payload
/// [n]     : Checksum = low byte of (length + type + sum(payload))
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u16,
    pub payload: Payload,
    /// False when the trailing checksum byte did not match, or was missing
    pub checksum_ok: bool,
}

impl Packet {
    /// Host-originated packet
    pub fn command(payload_type: PayloadType, bytes: Vec<u8>) -> Self {
        Self {
            magic: HOST_MAGIC,
            payload: Payload::new(payload_type as u8, bytes),
            checksum_ok: true,
        }
    }

    /// Device-originated packet
    pub fn response(payload_type: PayloadType, bytes: Vec<u8>) -> Self {
        Self {
            magic: DEVICE_MAGIC,
            payload: Payload::new(payload_type as u8, bytes),
            checksum_ok: true,
        }
    }

    pub fn auth_command(password: [u8; 2]) -> Self {
        Self::command(PayloadType::Auth, password.to_vec())
    }

    pub fn mac_command() -> Self {
        Self::command(PayloadType::Mac, Vec::new())
    }

    pub fn display_command(mode: DisplayMode) -> Self {
        Self::command(PayloadType::Display, vec![mode as u8])
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    pub fn is_host(&self) -> bool {
        self.magic == HOST_MAGIC
    }

    pub fn is_device(&self) -> bool {
        self.magic == DEVICE_MAGIC
    }

    /// Serialize into a wire frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = self.payload.bytes();
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(bytes.len()));
        }

        let length = (bytes.len() + 2) as u8;
        let type_byte = self.payload.type_byte();

        let mut frame = Vec::with_capacity(HEADER_LEN + 1 + bytes.len() + 1);
        frame.extend_from_slice(&self.magic.to_be_bytes());
        frame.push(length);
        frame.push(type_byte);
        frame.extend_from_slice(bytes);
        frame.push(checksum(length, type_byte, bytes));
        Ok(frame)
    }

    /// Parse a wire frame. Never fails: short or truncated frames degrade
    /// to an `Unknown` payload with `checksum_ok` cleared.
    pub fn decode(frame: &[u8]) -> Self {
        #[cfg(debug_assertions)]
        trace!("Raw frame: {:02X?}", frame);

        let magic = match frame {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            [] => 0,
        };

        let length = match frame.get(2) {
            Some(&length) if length >= 2 => length,
            _ => return Self::malformed(magic, PayloadType::Unknown as u8, Vec::new()),
        };

        let type_byte = match frame.get(HEADER_LEN) {
            Some(&t) => t,
            None => return Self::malformed(magic, PayloadType::Unknown as u8, Vec::new()),
        };

        let start = HEADER_LEN + 1;
        let end = start + (length as usize - 2);
        let Some(bytes) = frame.get(start..end) else {
            let partial = frame.get(start..).unwrap_or_default().to_vec();
            return Self::malformed(magic, type_byte, partial);
        };

        let checksum_ok = frame
            .get(end)
            .is_some_and(|&c| c == checksum(length, type_byte, bytes));

        Self {
            magic,
            payload: Payload::new(type_byte, bytes.to_vec()),
            checksum_ok,
        }
    }

    fn malformed(magic: u16, type_byte: u8, bytes: Vec<u8>) -> Self {
        Self {
            magic,
            payload: Payload::Unknown { type_byte, bytes },
            checksum_ok: false,
        }
    }

    /// Decode a `Reading` payload
    pub fn reading(&self) -> Result<Reading, ProtocolError> {
        match &self.payload {
            Payload::Reading(bytes) => Reading::from_bytes(bytes),
            other => Err(ProtocolError::WrongPayloadType {
                expected: PayloadType::Reading,
                actual: other.payload_type(),
            }),
        }
    }

    /// Decode a `MAC` payload
    pub fn mac(&self) -> Result<MacAddress, ProtocolError> {
        match &self.payload {
            Payload::Mac(bytes) => MacAddress::from_bytes(bytes),
            other => Err(ProtocolError::WrongPayloadType {
                expected: PayloadType::Mac,
                actual: other.payload_type(),
            }),
        }
    }
}

/// Low byte of `length + type + sum(payload)`
pub fn checksum(length: u8, type_byte: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(length.wrapping_add(type_byte), |acc, b| acc.wrapping_add(*b))
}

/// A physiological sample
///
/// # Payload Structure (15 bytes, little-endian)
///
/// ```text
/// [0-2]   : IR1 intensity (u24)
/// [3-5]   : IR2 intensity (u24)
/// [6]     : Status
/// [7]     : SpO2 (%)
/// [8-9]   : RR interval (u16, units of 2 ms)
/// [10]    : Battery
/// [11]    : Perfusion index (tenths of %)
/// [12]    : Pulse rate (bpm)
/// [13]    : SDNN
/// [14]    : Sample index
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reading {
    pub ir1: u32,
    pub ir2: u32,
    pub status: u8,
    pub spo2: u8,
    pub rr_interval: u16,
    pub battery: u8,
    pub pi: u8,
    pub pr: u8,
    pub sdnn: u8,
    pub sample_index: u8,
}

impl Reading {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let b: &[u8; READING_LEN] = bytes.try_into().map_err(|_| ProtocolError::WrongPayloadSize {
            kind: PayloadType::Reading,
            expected: READING_LEN,
            actual: bytes.len(),
        })?;

        Ok(Self {
            ir1: u32::from_le_bytes([b[0], b[1], b[2], 0]),
            ir2: u32::from_le_bytes([b[3], b[4], b[5], 0]),
            status: b[6],
            spo2: b[7],
            rr_interval: u16::from_le_bytes([b[8], b[9]]),
            battery: b[10],
            pi: b[11],
            pr: b[12],
            sdnn: b[13],
            sample_index: b[14],
        })
    }

    /// Inverse of [`Reading::from_bytes`]; intensities are truncated to 24 bits
    pub fn to_bytes(&self) -> [u8; READING_LEN] {
        let ir1 = self.ir1.to_le_bytes();
        let ir2 = self.ir2.to_le_bytes();
        let rr = self.rr_interval.to_le_bytes();
        [
            ir1[0],
            ir1[1],
            ir1[2],
            ir2[0],
            ir2[1],
            ir2[2],
            self.status,
            self.spo2,
            rr[0],
            rr[1],
            self.battery,
            self.pi,
            self.pr,
            self.sdnn,
            self.sample_index,
        ]
    }

    /// Perfusion index in percent
    pub fn perfusion_index(&self) -> f32 {
        self.pi as f32 / 10.0
    }

    pub fn rr_interval_ms(&self) -> u32 {
        self.rr_interval as u32 * 2
    }
}

/// Hardware address reported in a `MAC` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; MAC_LEN]);

impl MacAddress {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let octets = bytes.try_into().map_err(|_| ProtocolError::WrongPayloadSize {
            kind: PayloadType::Mac,
            expected: MAC_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(octets))
    }

    /// From the low 48 bits of a native Bluetooth address
    pub fn from_u64(raw: u64) -> Self {
        let b = raw.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn to_u64(self) -> u64 {
        let [a, b, c, d, e, g] = self.0;
        u64::from_be_bytes([0, 0, a, b, c, d, e, g])
    }
}

impl FromStr for MacAddress {
    type Err = String;

    /// Parses `AA:BB:CC:DD:EE:FF`, in either case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; MAC_LEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("too few octets in {s}"))?;
            *octet = u8::from_str_radix(part, 16).map_err(|e| format!("{part}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets in {s}"));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Lowercase a UUID and strip any surrounding braces
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reading_bytes() -> [u8; READING_LEN] {
        [
            0x10, 0x20, 0x03, // IR1 = 0x032010
            0xff, 0x00, 0x01, // IR2 = 0x0100ff
            0x00, // status
            98,   // SpO2
            0xa0, 0x01, // RR = 416
            80,   // battery
            35,   // PI
            72,   // PR
            41,   // SDNN
            7,    // sample index
        ]
    }

    #[test]
    fn test_auth_command_bytes() {
        let frame = Packet::auth_command([0x00, 0x00]).encode().unwrap();
        assert_eq!(frame, vec![0x55, 0xaa, 0x04, 0xb1, 0x00, 0x00, 0xb5]);
    }

    #[test]
    fn test_mac_and_display_command_bytes() {
        assert_eq!(
            Packet::mac_command().encode().unwrap(),
            vec![0x55, 0xaa, 0x02, 0xba, 0xbc]
        );
        assert_eq!(
            Packet::display_command(DisplayMode::SdnnSpo2).encode().unwrap(),
            vec![0x55, 0xaa, 0x03, 0xbb, 0x04, 0xc2]
        );
    }

    #[test]
    fn test_round_trip_preserves_type_and_payload() {
        for len in [0usize, 1, 15, 100, MAX_PAYLOAD_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            for kind in [PayloadType::Auth, PayloadType::Reading, PayloadType::Display] {
                let packet = Packet::command(kind, payload.clone());
                let decoded = Packet::decode(&packet.encode().unwrap());
                assert_eq!(decoded, packet);
            }
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = Packet::command(PayloadType::Auth, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(
            packet.encode(),
            Err(ProtocolError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let frame = Packet::response(PayloadType::Reading, sample_reading_bytes().to_vec())
            .encode()
            .unwrap();
        for i in 4..frame.len() - 1 {
            let mut corrupt = frame.clone();
            corrupt[i] ^= 0x01;
            let decoded = Packet::decode(&corrupt);
            assert!(!decoded.checksum_ok, "flip at byte {i} went unnoticed");
        }
    }

    #[test]
    fn test_corrupt_frame_still_passes_through() {
        let mut frame = Packet::auth_command([1, 2]).encode().unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);

        let decoded = Packet::decode(&frame);
        assert_eq!(decoded.payload, Payload::Auth(vec![1, 2]));
        assert!(!decoded.checksum_ok);
    }

    #[test]
    fn test_short_length_degrades_to_unknown() {
        let decoded = Packet::decode(&[0xaa, 0x55, 0x01, 0xd0, 0x00]);
        assert_eq!(decoded.magic, DEVICE_MAGIC);
        assert_eq!(decoded.payload_type(), PayloadType::Unknown);
        assert!(decoded.payload.bytes().is_empty());
    }

    #[test]
    fn test_empty_and_truncated_frames_degrade() {
        assert_eq!(Packet::decode(&[]).payload_type(), PayloadType::Unknown);
        assert_eq!(Packet::decode(&[0xaa]).payload_type(), PayloadType::Unknown);

        let truncated = Packet::decode(&[0xaa, 0x55, 0x11, 0xd0, 0x01, 0x02]);
        assert_eq!(
            truncated.payload,
            Payload::Unknown {
                type_byte: 0xd0,
                bytes: vec![0x01, 0x02]
            }
        );
        assert!(!truncated.checksum_ok);
    }

    #[test]
    fn test_missing_checksum_byte_is_not_ok() {
        let mut frame = Packet::mac_command().encode().unwrap();
        frame.pop();
        let decoded = Packet::decode(&frame);
        assert_eq!(decoded.payload, Payload::Mac(vec![]));
        assert!(!decoded.checksum_ok);
    }

    #[test]
    fn test_unknown_type_byte_kept() {
        let packet = Packet {
            magic: DEVICE_MAGIC,
            payload: Payload::Unknown {
                type_byte: 0x42,
                bytes: vec![9],
            },
            checksum_ok: true,
        };
        let decoded = Packet::decode(&packet.encode().unwrap());
        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload.type_byte(), 0x42);
    }

    #[test]
    fn test_reading_decode() {
        let packet = Packet::response(PayloadType::Reading, sample_reading_bytes().to_vec());
        let frame = packet.encode().unwrap();
        let reading = Packet::decode(&frame).reading().unwrap();

        assert_eq!(reading.ir1, 0x032010);
        assert_eq!(reading.ir2, 0x0100ff);
        assert_eq!(reading.spo2, 98);
        assert_eq!(reading.pr, 72);
        assert_eq!(reading.perfusion_index(), 3.5);
        assert_eq!(reading.rr_interval_ms(), 832);
        assert_eq!(reading.battery, 80);
        assert_eq!(reading.sdnn, 41);
        assert_eq!(reading.sample_index, 7);
        assert_eq!(reading.to_bytes(), sample_reading_bytes());
    }

    #[test]
    fn test_typed_views_check_variant_and_size() {
        let auth = Packet::auth_command([0, 0]);
        assert!(matches!(
            auth.reading(),
            Err(ProtocolError::WrongPayloadType {
                expected: PayloadType::Reading,
                actual: PayloadType::Auth
            })
        ));

        let short = Packet::response(PayloadType::Reading, vec![0; 14]);
        assert!(matches!(
            short.reading(),
            Err(ProtocolError::WrongPayloadSize { actual: 14, .. })
        ));

        let mac = Packet::response(PayloadType::Mac, vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(mac.mac().unwrap().to_string(), "DE:AD:BE:EF:00:01");
        assert!(Packet::mac_command().mac().is_err());
    }

    #[test]
    fn test_mac_address_conversions() {
        let mac = MacAddress::from_u64(0x0000_c0ff_ee00_0001);
        assert_eq!(mac.0, [0xc0, 0xff, 0xee, 0x00, 0x00, 0x01]);
        assert_eq!(mac.to_u64(), 0xc0ff_ee00_0001);
        assert_eq!("c0:FF:ee:00:00:01".parse::<MacAddress>(), Ok(mac));
        assert!("c0:ff:ee".parse::<MacAddress>().is_err());
        assert!("c0:ff:ee:00:00:01:02".parse::<MacAddress>().is_err());
        assert!("zz:ff:ee:00:00:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_normalize_uuid() {
        assert_eq!(
            normalize_uuid("{D44BC439-ABFD-45A2-B575-925416129600}"),
            COMMAND_UUID
        );
        assert_eq!(normalize_uuid(COMMAND_UUID), COMMAND_UUID);
    }
}
