//! BLE Command Bridge
//!
//! Line-oriented command exchange with an embedded peripheral over a BLE GATT
//! link. The platform stack is supplied through the traits in
//! [`infrastructure::bluetooth::native`]; everything above it lives here.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{AppEvent, ConnectionStatus, MessageSeverity, ScannedDevice, StatusMessage};
pub use infrastructure::bluetooth::{BleError, BluetoothService, GattSession, ServiceConfig};
