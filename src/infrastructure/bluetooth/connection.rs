//! BLE Connection Module
//!
//! [`GattSession`] owns the single connection to the peripheral and turns
//! each native GATT request into one awaitable call with a bounded wait.
//!
//! Native completions are fanned into five single-slot mailboxes, one per
//! event kind. A request drains its mailbox before it is issued, so a late
//! completion of an earlier, timed-out request cannot satisfy it. Calls are
//! serialized by an async guard; callback delivery never takes that guard.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::error::{BleError, BleResult};
use crate::infrastructure::bluetooth::mailbox::Mailbox;
use crate::infrastructure::bluetooth::native::{
    Characteristic, ConnectionState, GattCallback, GattConnection, GattStatus, NativeGatt,
    Service,
};
use crate::infrastructure::bluetooth::protocol::{
    CCC_DESCRIPTOR_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default wait for a single GATT operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy)]
struct StateEvent {
    status: GattStatus,
    state: ConnectionState,
}

#[derive(Debug, Clone)]
struct DiscoveryEvent {
    services: Vec<Service>,
}

#[derive(Debug, Clone)]
struct CharacteristicEvent {
    characteristic: Uuid,
    value: String,
    status: GattStatus,
}

#[derive(Debug, Clone)]
struct DescriptorEvent {
    descriptor: Uuid,
    status: GattStatus,
}

#[derive(Debug, Clone)]
struct ChangeEvent {
    characteristic: Uuid,
    value: String,
}

/// State shared between the session and the native callback
struct SessionShared {
    connection: Mutex<Option<Arc<dyn GattConnection>>>,
    services: Mutex<Vec<Service>>,
    connected: watch::Sender<bool>,
    state_events: Mailbox<StateEvent>,
    discovery_events: Mailbox<DiscoveryEvent>,
    result_events: Mailbox<CharacteristicEvent>,
    descriptor_events: Mailbox<DescriptorEvent>,
    change_events: Mailbox<ChangeEvent>,
    /// Set when a notification wait timed out; the next notification is dropped
    change_timed_out: AtomicBool,
}

impl SessionShared {
    fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            connection: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            connected,
            state_events: Mailbox::new(),
            discovery_events: Mailbox::new(),
            result_events: Mailbox::new(),
            descriptor_events: Mailbox::new(),
            change_events: Mailbox::new(),
            change_timed_out: AtomicBool::new(false),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<Arc<dyn GattConnection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn services(&self) -> MutexGuard<'_, Vec<Service>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> BleResult<Arc<dyn GattConnection>> {
        self.connection().clone().ok_or(BleError::IllegalState)
    }

    /// Drop the handle, cached services and connected flag
    fn invalidate(&self) {
        let connection = {
            let mut slot = self.connection();
            let connection = slot.take();
            self.connected
                .send_if_modified(|connected| std::mem::replace(connected, false));
            connection
        };
        self.services().clear();
        if let Some(connection) = connection {
            connection.close();
            info!("GATT session closed");
        }
    }
}

impl GattCallback for SessionShared {
    fn on_connection_state_change(&self, status: GattStatus, new_state: ConnectionState) {
        debug!("Connection state: {:?} ({:?})", new_state, status);
        self.state_events.post(StateEvent {
            status,
            state: new_state,
        });
        if new_state == ConnectionState::Disconnected {
            self.invalidate();
        }
    }

    fn on_services_discovered(&self, services: Vec<Service>, status: GattStatus) {
        if !status.is_success() {
            warn!("Service discovery reported {:?}", status);
        }
        self.discovery_events.post(DiscoveryEvent { services });
    }

    fn on_characteristic_read(&self, characteristic: Uuid, value: &[u8], status: GattStatus) {
        let value = String::from_utf8_lossy(value).into_owned();
        debug!("onRead {:?}", value);
        self.result_events.post(CharacteristicEvent {
            characteristic,
            value,
            status,
        });
    }

    fn on_characteristic_write(&self, characteristic: Uuid, value: &[u8], status: GattStatus) {
        let value = String::from_utf8_lossy(value).into_owned();
        debug!("onWrite {:?}", value);
        self.result_events.post(CharacteristicEvent {
            characteristic,
            value,
            status,
        });
    }

    fn on_descriptor_write(&self, _characteristic: Uuid, descriptor: Uuid, status: GattStatus) {
        self.descriptor_events
            .post(DescriptorEvent { descriptor, status });
    }

    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]) {
        let value = String::from_utf8_lossy(value).into_owned();
        if self.change_timed_out.swap(false, Ordering::SeqCst) {
            debug!("Dropping late notification {:?}", value);
            return;
        }
        debug!("onChanged {:?}", value);
        self.change_events.post(ChangeEvent {
            characteristic,
            value,
        });
    }
}

/// One logical connection to one peripheral.
pub struct GattSession {
    native: Arc<dyn NativeGatt>,
    shared: Arc<SessionShared>,
    guard: tokio::sync::Mutex<()>,
    operation_timeout: Duration,
}

impl GattSession {
    pub fn new(native: Arc<dyn NativeGatt>) -> Self {
        Self::with_timeout(native, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Create a session with a custom base timeout. Discovery waits twice as
    /// long.
    pub fn with_timeout(native: Arc<dyn NativeGatt>, operation_timeout: Duration) -> Self {
        Self {
            native,
            shared: Arc::new(SessionShared::new()),
            guard: tokio::sync::Mutex::new(()),
            operation_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Observe the connected flag from another task
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Whether a connection handle is held
    pub fn is_active(&self) -> bool {
        self.shared.connection().is_some()
    }

    /// Services cached by the last successful discovery
    pub fn services(&self) -> Vec<Service> {
        self.shared.services().clone()
    }

    pub fn find_characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.shared
            .services()
            .iter()
            .find_map(|service| service.characteristic(uuid).cloned())
    }

    /// Whether the last notification wait ended in a timeout and the next
    /// notification will be discarded
    pub fn is_notification_stale(&self) -> bool {
        self.shared.change_timed_out.load(Ordering::SeqCst)
    }

    /// Forget any notification nobody has consumed yet and start a fresh
    /// notification stream: a timeout from an earlier exchange no longer
    /// marks the next arrival as late.
    pub fn discard_notifications(&self) {
        self.shared.change_timed_out.store(false, Ordering::SeqCst);
        if self.shared.change_events.drain() {
            debug!("Discarded unconsumed notification");
        }
    }

    /// Open the connection and wait for the link to come up.
    pub async fn connect(&self, device: &ScannedDevice) -> BleResult<()> {
        let _guard = self.guard.lock().await;
        info!("Connecting to {} ({})", device.display_name(), device.address);

        self.shared.state_events.drain();
        let callback: Arc<dyn GattCallback> = self.shared.clone();
        let connection = self.native.connect_gatt(device, callback)?;
        *self.shared.connection() = Some(connection.clone());

        let limit = self.operation_timeout;
        match timeout(limit, self.shared.state_events.recv()).await {
            Ok(StateEvent {
                state: ConnectionState::Connected,
                ..
            }) => {
                let slot = self.shared.connection();
                if slot.is_none() {
                    // Dropped again before we got here
                    return Err(BleError::IllegalState);
                }
                self.shared.connected.send_replace(true);
                info!("Connected to {}", device.address);
                Ok(())
            }
            Ok(event) => {
                warn!(
                    "Connection to {} ended in {:?} ({:?})",
                    device.address, event.state, event.status
                );
                self.release(&connection);
                Err(BleError::IllegalState)
            }
            Err(_) => {
                warn!("No connection event from {} within {:?}", device.address, limit);
                self.release(&connection);
                Err(BleError::Timeout(limit))
            }
        }
    }

    /// Close the handle opened by a failed connect, unless a disconnect event
    /// already did.
    fn release(&self, connection: &Arc<dyn GattConnection>) {
        let mut slot = self.shared.connection();
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            slot.take();
            drop(slot);
            connection.close();
        }
    }

    /// Disconnect and wait for the link to go down. No-op without a session.
    ///
    /// On timeout the handle is dropped anyway; the session is unusable either
    /// way.
    pub async fn disconnect(&self) -> BleResult<()> {
        let _guard = self.guard.lock().await;
        let connection = match self.shared.connection().clone() {
            Some(connection) => connection,
            None => {
                debug!("Disconnect requested without an active session");
                return Ok(());
            }
        };

        info!("Disconnecting...");
        let mut connected = self.shared.connected.subscribe();
        connection.disconnect();

        let limit = self.operation_timeout;
        match timeout(limit, session_lost(&mut connected)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("No disconnect event within {:?}", limit);
                self.shared.invalidate();
                Err(BleError::Timeout(limit))
            }
        }
    }

    pub async fn discover_services(&self) -> BleResult<Vec<Service>> {
        let _guard = self.guard.lock().await;
        let connection = self.shared.current()?;

        self.shared.discovery_events.drain();
        connection.discover_services()?;
        let event = self
            .await_event(&self.shared.discovery_events, self.operation_timeout * 2)
            .await?;

        info!("Discovered {} services", event.services.len());
        *self.shared.services() = event.services.clone();
        Ok(event.services)
    }

    /// Enable or disable notifications and write the configuration descriptor.
    pub async fn set_notify(&self, characteristic: &Characteristic, enable: bool) -> BleResult<()> {
        let _guard = self.guard.lock().await;
        let connection = self.shared.current()?;
        if !characteristic.has_descriptor(CCC_DESCRIPTOR_UUID) {
            return Err(BleError::DescriptorNotFound(CCC_DESCRIPTOR_UUID));
        }

        self.shared.descriptor_events.drain();
        connection.set_characteristic_notification(characteristic, enable)?;
        let value = if enable {
            ENABLE_NOTIFICATION_VALUE
        } else {
            DISABLE_NOTIFICATION_VALUE
        };
        connection.write_descriptor(characteristic, CCC_DESCRIPTOR_UUID, &value)?;

        let event = self
            .await_event(&self.shared.descriptor_events, self.operation_timeout)
            .await?;
        if !event.status.is_success() {
            warn!(
                "Descriptor {} write reported {:?}",
                event.descriptor, event.status
            );
        }
        info!(
            "Notifications {} for {}",
            if enable { "enabled" } else { "disabled" },
            characteristic.uuid
        );
        Ok(())
    }

    /// Write `value` and wait for the write completion.
    ///
    /// The completion is not matched against this write; callers keep a single
    /// request outstanding.
    pub async fn write_char(&self, characteristic: &Characteristic, value: &str) -> BleResult<()> {
        let _guard = self.guard.lock().await;
        let connection = self.shared.current()?;

        self.shared.result_events.drain();
        debug!("write {:?}", value);
        connection.write_characteristic(characteristic, value.as_bytes())?;
        let event = self
            .await_event(&self.shared.result_events, self.operation_timeout)
            .await?;
        log_result("write", characteristic, &event);
        Ok(())
    }

    pub async fn read_char(&self, characteristic: &Characteristic) -> BleResult<String> {
        let _guard = self.guard.lock().await;
        let connection = self.shared.current()?;

        self.shared.result_events.drain();
        connection.read_characteristic(characteristic)?;
        let event = self
            .await_event(&self.shared.result_events, self.operation_timeout)
            .await?;
        log_result("read", characteristic, &event);
        debug!("read {:?}", event.value);
        Ok(event.value)
    }

    /// Wait for the next change notification.
    ///
    /// A timeout marks the notification stream stale so a late arrival is
    /// discarded rather than handed to the next waiter.
    pub async fn wait_for_change(&self, characteristic: &Characteristic) -> BleResult<String> {
        let _guard = self.guard.lock().await;
        self.shared.change_timed_out.store(false, Ordering::SeqCst);

        match self
            .await_event(&self.shared.change_events, self.operation_timeout)
            .await
        {
            Ok(event) => {
                if event.characteristic != characteristic.uuid {
                    debug!(
                        "Notification from {} while waiting on {}",
                        event.characteristic, characteristic.uuid
                    );
                }
                Ok(event.value)
            }
            Err(e @ BleError::Timeout(_)) => {
                self.shared.change_timed_out.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for a mailbox value, giving up when the deadline passes or the
    /// session drops.
    async fn await_event<T>(&self, mailbox: &Mailbox<T>, limit: Duration) -> BleResult<T> {
        let mut connected = self.shared.connected.subscribe();
        let waited = timeout(limit, async {
            tokio::select! {
                biased;
                event = mailbox.recv() => Ok(event),
                _ = session_lost(&mut connected) => Err(BleError::IllegalState),
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(BleError::Timeout(limit)),
        }
    }
}

/// Resolves once the connected flag is false
async fn session_lost(connected: &mut watch::Receiver<bool>) {
    loop {
        if !*connected.borrow_and_update() {
            return;
        }
        if connected.changed().await.is_err() {
            return;
        }
    }
}

fn log_result(operation: &str, characteristic: &Characteristic, event: &CharacteristicEvent) {
    if !event.status.is_success() {
        warn!("{} on {} reported {:?}", operation, characteristic.uuid, event.status);
    }
    if event.characteristic != characteristic.uuid {
        debug!(
            "{} completion for {} while waiting on {}",
            operation, event.characteristic, characteristic.uuid
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::COMMAND_CHAR_UUID;
    use crate::infrastructure::bluetooth::simulated::{ScriptedFirmware, SimulatedPeripheral};
    use tokio::time::{sleep, Instant};

    const TIMEOUT: Duration = DEFAULT_OPERATION_TIMEOUT;

    fn device() -> ScannedDevice {
        ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01")
    }

    fn session_for(peripheral: &SimulatedPeripheral) -> GattSession {
        GattSession::new(Arc::new(peripheral.clone()))
    }

    async fn subscribed(peripheral: &SimulatedPeripheral) -> (GattSession, Characteristic) {
        let session = session_for(peripheral);
        session.connect(&device()).await.unwrap();
        session.discover_services().await.unwrap();
        let characteristic = session.find_characteristic(COMMAND_CHAR_UUID).unwrap();
        session.set_notify(&characteristic, true).await.unwrap();
        (session, characteristic)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_marks_session_connected() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);

        session.connect(&device()).await.unwrap();
        assert!(session.is_connected());
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_retains_nothing() {
        let peripheral = SimulatedPeripheral::new(vec![device()]).silent_connect();
        let session = session_for(&peripheral);

        let result = session.connect(&device()).await;
        assert_eq!(result, Err(BleError::Timeout(TIMEOUT)));
        assert!(!session.is_connected());
        assert!(!session.is_active());
        assert_eq!(peripheral.closed_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused_is_illegal_state() {
        let peripheral = SimulatedPeripheral::new(vec![device()]).refuse_connect();
        let session = session_for(&peripheral);

        assert_eq!(session.connect(&device()).await, Err(BleError::IllegalState));
        assert!(!session.is_connected());
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_without_session_fail_fast() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);
        let characteristic = peripheral.command_characteristic();

        let started = Instant::now();
        assert_eq!(session.discover_services().await, Err(BleError::IllegalState));
        assert_eq!(
            session.write_char(&characteristic, "get").await,
            Err(BleError::IllegalState)
        );
        assert_eq!(
            session.read_char(&characteristic).await,
            Err(BleError::IllegalState)
        );
        assert_eq!(
            session.set_notify(&characteristic, true).await,
            Err(BleError::IllegalState)
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_caches_services() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);
        session.connect(&device()).await.unwrap();

        let services = session.discover_services().await.unwrap();
        assert_eq!(services, session.services());
        assert!(session.find_characteristic(COMMAND_CHAR_UUID).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_descriptor_is_reported() {
        let mut characteristic = SimulatedPeripheral::command_characteristic_template();
        characteristic.descriptors.clear();
        let services = vec![Service {
            uuid: characteristic.service_uuid,
            characteristics: vec![characteristic.clone()],
        }];
        let peripheral = SimulatedPeripheral::new(vec![device()]).with_services(services);
        let session = session_for(&peripheral);
        session.connect(&device()).await.unwrap();
        session.discover_services().await.unwrap();

        assert_eq!(
            session.set_notify(&characteristic, true).await,
            Err(BleError::DescriptorNotFound(CCC_DESCRIPTOR_UUID))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_drop_invalidates_session() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let (session, characteristic) = subscribed(&peripheral).await;

        peripheral.drop_link();
        assert!(!session.is_connected());
        assert!(!session.is_active());
        assert!(session.services().is_empty());
        assert_eq!(
            session.write_char(&characteristic, "get").await,
            Err(BleError::IllegalState)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_ends_in_flight_wait() {
        let peripheral = SimulatedPeripheral::new(vec![device()]).silent_reads();
        let (session, characteristic) = subscribed(&peripheral).await;
        let session = Arc::new(session);

        let reader = {
            let session = session.clone();
            let characteristic = characteristic.clone();
            tokio::spawn(async move { session.read_char(&characteristic).await })
        };
        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        peripheral.drop_link();

        assert_eq!(reader.await.unwrap(), Err(BleError::IllegalState));
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);
        assert_eq!(session.disconnect().await, Ok(()));

        session.connect(&device()).await.unwrap();
        assert_eq!(session.disconnect().await, Ok(()));
        assert!(!session.is_connected());
        assert_eq!(session.disconnect().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_peripheral_drop() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);
        session.connect(&device()).await.unwrap();

        peripheral.drop_link();
        assert_eq!(session.disconnect().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timeout_still_drops_handle() {
        let peripheral = SimulatedPeripheral::new(vec![device()]).silent_disconnect();
        let session = session_for(&peripheral);
        session.connect(&device()).await.unwrap();

        assert_eq!(session.disconnect().await, Err(BleError::Timeout(TIMEOUT)));
        assert!(!session.is_connected());
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_latest_notification() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let (session, characteristic) = subscribed(&peripheral).await;

        peripheral.inject_notification("first\r\n");
        peripheral.inject_notification("second\r\n");
        assert_eq!(
            session.wait_for_change(&characteristic).await.unwrap(),
            "second\r\n"
        );
        assert_eq!(
            session.wait_for_change(&characteristic).await,
            Err(BleError::Timeout(TIMEOUT))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_notification_after_timeout_is_dropped() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let (session, characteristic) = subscribed(&peripheral).await;

        assert_eq!(
            session.wait_for_change(&characteristic).await,
            Err(BleError::Timeout(TIMEOUT))
        );
        assert!(session.is_notification_stale());

        peripheral.inject_notification("late\r\n");
        assert!(!session.is_notification_stale());
        assert_eq!(
            session.wait_for_change(&characteristic).await,
            Err(BleError::Timeout(TIMEOUT))
        );

        let session = Arc::new(session);
        let waiter = {
            let session = session.clone();
            let characteristic = characteristic.clone();
            tokio::spawn(async move { session.wait_for_change(&characteristic).await })
        };
        sleep(Duration::from_millis(100)).await;
        peripheral.inject_notification("fresh\r\n");
        assert_eq!(waiter.await.unwrap().unwrap(), "fresh\r\n");
        assert!(!session.is_notification_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_starts_fresh_notification_stream() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let (session, characteristic) = subscribed(&peripheral).await;

        assert_eq!(
            session.wait_for_change(&characteristic).await,
            Err(BleError::Timeout(TIMEOUT))
        );
        assert!(session.is_notification_stale());

        session.discard_notifications();
        assert!(!session.is_notification_stale());
        peripheral.inject_notification("next\r\n");
        assert_eq!(
            session.wait_for_change(&characteristic).await.unwrap(),
            "next\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_read_returns_reply() {
        let firmware = ScriptedFirmware::new(vec![Some("pong\r\n".to_string())]);
        let peripheral = SimulatedPeripheral::new(vec![device()]).with_firmware(firmware);
        let (session, characteristic) = subscribed(&peripheral).await;

        session.write_char(&characteristic, "ping").await.unwrap();
        assert_eq!(session.read_char(&characteristic).await.unwrap(), "pong\r\n");
        assert_eq!(peripheral.writes(), vec!["ping".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_flag_is_observable() {
        let peripheral = SimulatedPeripheral::new(vec![device()]);
        let session = session_for(&peripheral);
        let mut connected = session.subscribe_connected();
        assert!(!*connected.borrow_and_update());

        session.connect(&device()).await.unwrap();
        connected.changed().await.unwrap();
        assert!(*connected.borrow_and_update());

        peripheral.drop_link();
        connected.changed().await.unwrap();
        assert!(!*connected.borrow_and_update());
    }
}
