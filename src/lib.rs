//! Host-side core for a BLE pulse oximeter: frame codec, connection state
//! machine, worker thread with command/event queues, and the session logic
//! that drives them.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{Candidate, ConnectionState, Device, OximeterCommand, OximeterEvent};
pub use domain::session::{SessionConfig, SessionController};
pub use domain::settings::{Settings, SettingsService, TransportKind};
pub use infrastructure::bluetooth::open_transport;
pub use infrastructure::bluetooth::protocol::{DisplayMode, MacAddress, Packet, Payload, PayloadType, Reading};
pub use infrastructure::bluetooth::OximeterService;
