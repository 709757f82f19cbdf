//! Simulated Peripheral
//!
//! In-process stand-in for the platform BLE stack and the peripheral behind
//! it. Requests complete on spawned tasks after a configurable latency, the
//! way the real stack completes them on its own callback thread.
//!
//! The peripheral side follows the reference firmware: every write replaces
//! the characteristic value, the firmware may answer with a new value that is
//! notified (truncated to the ATT payload size) and kept for reads.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::error::{BleError, BleResult};
use crate::infrastructure::bluetooth::native::{
    Characteristic, ConnectionState, GattCallback, GattConnection, GattStatus, NativeGatt,
    NativeScanner, ScanCallback, Service,
};
use crate::infrastructure::bluetooth::protocol::{
    PeripheralError, ACK_TOKEN, CCC_DESCRIPTOR_UUID, COMMAND_CHAR_UUID,
    ENABLE_NOTIFICATION_VALUE,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Service hosting the command characteristic on the reference firmware
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Command that starts a journal transfer
pub const GET_COMMAND: &str = "get";

/// ATT payload of a notification at the default MTU
pub const DEFAULT_NOTIFY_PAYLOAD: usize = 20;

/// GATT status the platform reports for a failed connection attempt
const GATT_ERROR: u8 = 133;

/// Peripheral-side command handling
pub trait Firmware: Send {
    /// React to a written value. `Some` replaces the characteristic value and
    /// is notified; `None` leaves the written value in place.
    fn on_write(&mut self, value: &str) -> Option<String>;
}

/// Journal transfer of the reference firmware
pub struct JournalFirmware {
    lines: Vec<String>,
    next: Option<usize>,
}

impl JournalFirmware {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines, next: None }
    }

    /// Ten numbered journal lines
    pub fn reference() -> Self {
        Self::new(
            (1..=10)
                .map(|n| format!("journal string {}\r\n", n))
                .collect(),
        )
    }
}

impl Firmware for JournalFirmware {
    fn on_write(&mut self, value: &str) -> Option<String> {
        if value.starts_with(GET_COMMAND) {
            self.next = Some(1);
            return Some(self.lines.first().cloned().unwrap_or_default());
        }
        if !value.starts_with(ACK_TOKEN) {
            return Some(PeripheralError::UnsupportedCommand.wire_text());
        }

        let index = self.next?;
        match self.lines.get(index) {
            Some(line) => {
                self.next = Some(index + 1);
                Some(line.clone())
            }
            None => {
                self.next = None;
                Some(String::new())
            }
        }
    }
}

/// Answers writes from a fixed script, one entry per write
pub struct ScriptedFirmware {
    replies: VecDeque<Option<String>>,
}

impl ScriptedFirmware {
    pub fn new(replies: Vec<Option<String>>) -> Self {
        Self {
            replies: replies.into(),
        }
    }
}

impl Firmware for ScriptedFirmware {
    fn on_write(&mut self, _value: &str) -> Option<String> {
        self.replies.pop_front().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectBehaviour {
    Accept,
    Refuse,
    Silent,
}

#[derive(Debug, Clone)]
struct SimOptions {
    latency: Duration,
    notify_payload: usize,
    connect: ConnectBehaviour,
    answer_disconnect: bool,
    answer_reads: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            notify_payload: DEFAULT_NOTIFY_PAYLOAD,
            connect: ConnectBehaviour::Accept,
            answer_disconnect: true,
            answer_reads: true,
        }
    }
}

#[derive(Default)]
struct SimState {
    link: Weak<SimLink>,
    scan_callback: Option<Arc<dyn ScanCallback>>,
    value: Vec<u8>,
    notifying: bool,
    ccc: [u8; 2],
    writes: Vec<String>,
    closed_links: usize,
}

struct SimInner {
    devices: Vec<ScannedDevice>,
    services: Mutex<Vec<Service>>,
    options: Mutex<SimOptions>,
    state: Mutex<SimState>,
    firmware: Mutex<Box<dyn Firmware>>,
}

impl SimInner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> SimOptions {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_link(&self) -> Option<Arc<SimLink>> {
        self.state().link.upgrade()
    }

    /// Set the characteristic value and notify it if the client subscribed
    fn notify(&self, link: &SimLink, characteristic: Uuid, value: String) {
        let payload_size = self.options().notify_payload;
        let payload = {
            let mut state = self.state();
            state.value = value.into_bytes();
            if !state.notifying || state.ccc != ENABLE_NOTIFICATION_VALUE {
                debug!("Client not subscribed, value kept for reads");
                return;
            }
            let end = state.value.len().min(payload_size);
            state.value[..end].to_vec()
        };
        link.emit(|callback| callback.on_characteristic_changed(characteristic, &payload));
    }
}

/// Simulated platform stack with one peripheral behind it.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<SimInner>,
}

impl SimulatedPeripheral {
    /// A peripheral running the reference journal firmware, advertised under
    /// each of `devices`.
    pub fn new(devices: Vec<ScannedDevice>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                devices,
                services: Mutex::new(Self::default_services()),
                options: Mutex::new(SimOptions::default()),
                state: Mutex::new(SimState::default()),
                firmware: Mutex::new(Box::new(JournalFirmware::reference())),
            }),
        }
    }

    pub fn command_characteristic_template() -> Characteristic {
        Characteristic {
            uuid: COMMAND_CHAR_UUID,
            service_uuid: SERVICE_UUID,
            descriptors: vec![CCC_DESCRIPTOR_UUID],
        }
    }

    pub fn default_services() -> Vec<Service> {
        vec![Service {
            uuid: SERVICE_UUID,
            characteristics: vec![Self::command_characteristic_template()],
        }]
    }

    pub fn with_firmware(self, firmware: impl Firmware + 'static) -> Self {
        *self
            .inner
            .firmware
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Box::new(firmware);
        self
    }

    pub fn with_services(self, services: Vec<Service>) -> Self {
        *self
            .inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = services;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.configure(|options| options.latency = latency)
    }

    /// Bytes of the value carried by each notification
    pub fn with_notify_payload(self, notify_payload: usize) -> Self {
        self.configure(|options| options.notify_payload = notify_payload)
    }

    /// Never report the outcome of a connection attempt
    pub fn silent_connect(self) -> Self {
        self.configure(|options| options.connect = ConnectBehaviour::Silent)
    }

    /// Answer connection attempts with a disconnect
    pub fn refuse_connect(self) -> Self {
        self.configure(|options| options.connect = ConnectBehaviour::Refuse)
    }

    pub fn silent_disconnect(self) -> Self {
        self.configure(|options| options.answer_disconnect = false)
    }

    pub fn silent_reads(self) -> Self {
        self.configure(|options| options.answer_reads = false)
    }

    fn configure(self, update: impl FnOnce(&mut SimOptions)) -> Self {
        {
            let mut options = self
                .inner
                .options
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            update(&mut *options);
        }
        self
    }

    pub fn command_characteristic(&self) -> Characteristic {
        Self::command_characteristic_template()
    }

    /// Values written by the client, oldest first
    pub fn writes(&self) -> Vec<String> {
        self.inner.state().writes.clone()
    }

    /// Number of connection handles the client closed
    pub fn closed_links(&self) -> usize {
        self.inner.state().closed_links
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state().scan_callback.is_some()
    }

    /// Report an advertisement to a running scan
    pub fn advertise(&self, device: ScannedDevice) {
        let callback = self.inner.state().scan_callback.clone();
        if let Some(callback) = callback {
            callback.on_device_found(device);
        }
    }

    /// Drop the link from the peripheral side
    pub fn drop_link(&self) {
        if let Some(link) = self.inner.current_link() {
            debug!("Peripheral dropped the link");
            link.emit(|callback| {
                callback.on_connection_state_change(
                    GattStatus::Success,
                    ConnectionState::Disconnected,
                )
            });
        }
    }

    /// Send a notification on the command characteristic right away
    pub fn inject_notification(&self, value: &str) {
        if let Some(link) = self.inner.current_link() {
            self.inner.notify(&link, COMMAND_CHAR_UUID, value.to_string());
        }
    }
}

impl NativeGatt for SimulatedPeripheral {
    fn connect_gatt(
        &self,
        device: &ScannedDevice,
        callback: Arc<dyn GattCallback>,
    ) -> BleResult<Arc<dyn GattConnection>> {
        if !self.inner.devices.contains(device) {
            return Err(BleError::Native(format!("Unknown device {}", device.address)));
        }

        let link = Arc::new_cyclic(|me| SimLink {
            me: me.clone(),
            peripheral: self.inner.clone(),
            callback,
            closed: AtomicBool::new(false),
        });
        {
            let mut state = self.inner.state();
            state.link = Arc::downgrade(&link);
            state.notifying = false;
            state.ccc = [0, 0];
        }

        match self.inner.options().connect {
            ConnectBehaviour::Accept => link.spawn_event(|callback| {
                callback
                    .on_connection_state_change(GattStatus::Success, ConnectionState::Connected)
            }),
            ConnectBehaviour::Refuse => link.spawn_event(|callback| {
                callback.on_connection_state_change(
                    GattStatus::Failure(GATT_ERROR),
                    ConnectionState::Disconnected,
                )
            }),
            ConnectBehaviour::Silent => debug!("Ignoring connection attempt"),
        }

        Ok(link)
    }
}

impl NativeScanner for SimulatedPeripheral {
    fn start_le_scan(&self, callback: Arc<dyn ScanCallback>) -> BleResult<()> {
        self.inner.state().scan_callback = Some(callback);

        let inner = self.inner.clone();
        let latency = self.inner.options().latency;
        tokio::spawn(async move {
            for device in inner.devices.clone() {
                tokio::time::sleep(latency).await;
                let callback = inner.state().scan_callback.clone();
                match callback {
                    Some(callback) => callback.on_device_found(device),
                    None => break,
                }
            }
        });
        Ok(())
    }

    fn stop_le_scan(&self) {
        self.inner.state().scan_callback = None;
    }
}

/// Connection handle handed to the client
struct SimLink {
    me: Weak<SimLink>,
    peripheral: Arc<SimInner>,
    callback: Arc<dyn GattCallback>,
    closed: AtomicBool,
}

impl SimLink {
    /// Deliver an event now, unless the handle was closed
    fn emit(&self, event: impl FnOnce(&dyn GattCallback)) {
        if self.closed.load(Ordering::SeqCst) {
            trace!("Event suppressed on closed link");
            return;
        }
        event(self.callback.as_ref());
    }

    /// Deliver an event after the configured latency
    fn spawn_event(&self, event: impl FnOnce(&dyn GattCallback) + Send + 'static) {
        self.spawn(move |link| link.emit(event));
    }

    fn spawn(&self, action: impl FnOnce(&SimLink) + Send + 'static) {
        let me = self.me.clone();
        let latency = self.peripheral.options().latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if let Some(link) = me.upgrade() {
                action(link.as_ref());
            }
        });
    }
}

impl GattConnection for SimLink {
    fn disconnect(&self) {
        if self.peripheral.options().answer_disconnect {
            self.spawn_event(|callback| {
                callback
                    .on_connection_state_change(GattStatus::Success, ConnectionState::Disconnected)
            });
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.peripheral.state().closed_links += 1;
        }
    }

    fn discover_services(&self) -> BleResult<()> {
        let services = self
            .peripheral
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.spawn_event(move |callback| {
            callback.on_services_discovered(services, GattStatus::Success)
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        _characteristic: &Characteristic,
        enable: bool,
    ) -> BleResult<()> {
        self.peripheral.state().notifying = enable;
        Ok(())
    }

    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> BleResult<()> {
        let text = String::from_utf8_lossy(value).into_owned();
        {
            let mut state = self.peripheral.state();
            state.writes.push(text.clone());
            state.value = value.to_vec();
        }
        let reply = self
            .peripheral
            .firmware
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_write(&text);

        let uuid = characteristic.uuid;
        let written = value.to_vec();
        self.spawn(move |link| {
            link.emit(|callback| {
                callback.on_characteristic_write(uuid, &written, GattStatus::Success)
            });
            if let Some(reply) = reply {
                link.peripheral.notify(link, uuid, reply);
            }
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> BleResult<()> {
        if !self.peripheral.options().answer_reads {
            debug!("Ignoring read request");
            return Ok(());
        }
        let uuid = characteristic.uuid;
        self.spawn(move |link| {
            let value = link.peripheral.state().value.clone();
            link.emit(|callback| callback.on_characteristic_read(uuid, &value, GattStatus::Success));
        });
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &Characteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> BleResult<()> {
        if descriptor == CCC_DESCRIPTOR_UUID {
            let mut state = self.peripheral.state();
            state.ccc = [
                value.first().copied().unwrap_or(0),
                value.get(1).copied().unwrap_or(0),
            ];
        }
        let uuid = characteristic.uuid;
        self.spawn_event(move |callback| {
            callback.on_descriptor_write(uuid, descriptor, GattStatus::Success)
        });
        Ok(())
    }
}
