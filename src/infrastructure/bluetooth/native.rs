//! Native GATT Capability
//!
//! The platform BLE stack as seen by the bridge. Requests return as soon as
//! they are queued; completions arrive later, in any order, on the
//! [`GattCallback`] registered when the connection was opened. Callback
//! implementations must never block.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::error::BleResult;
use std::sync::Arc;
use uuid::Uuid;

/// Completion status reported with native events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(u8),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

/// Link state reported by connection-state events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl Characteristic {
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Event surface of the native stack.
pub trait GattCallback: Send + Sync {
    fn on_connection_state_change(&self, status: GattStatus, new_state: ConnectionState);
    fn on_services_discovered(&self, services: Vec<Service>, status: GattStatus);
    fn on_characteristic_read(&self, characteristic: Uuid, value: &[u8], status: GattStatus);
    fn on_characteristic_write(&self, characteristic: Uuid, value: &[u8], status: GattStatus);
    fn on_descriptor_write(&self, characteristic: Uuid, descriptor: Uuid, status: GattStatus);
    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]);
}

/// Opens connections. Platform context (adapter, application handle) is
/// owned by the implementation.
pub trait NativeGatt: Send + Sync {
    /// Start connecting; the outcome arrives as a connection-state event on
    /// `callback`, which stays registered for the life of the connection.
    fn connect_gatt(
        &self,
        device: &ScannedDevice,
        callback: Arc<dyn GattCallback>,
    ) -> BleResult<Arc<dyn GattConnection>>;
}

/// Handle to one open (or opening) connection.
pub trait GattConnection: Send + Sync {
    fn disconnect(&self);
    /// Release native resources; no further events are delivered
    fn close(&self);
    fn discover_services(&self) -> BleResult<()>;
    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> BleResult<()>;
    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> BleResult<()>;
    fn read_characteristic(&self, characteristic: &Characteristic) -> BleResult<()>;
    fn write_descriptor(
        &self,
        characteristic: &Characteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> BleResult<()>;
}

pub trait ScanCallback: Send + Sync {
    fn on_device_found(&self, device: ScannedDevice);
}

pub trait NativeScanner: Send + Sync {
    fn start_le_scan(&self, callback: Arc<dyn ScanCallback>) -> BleResult<()>;
    fn stop_le_scan(&self);
}
