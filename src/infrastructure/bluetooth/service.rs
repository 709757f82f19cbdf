//! Bluetooth Service Module
//!
//! Command protocol engine on top of [`GattSession`]: scanning, the
//! connect → discover → subscribe sequence, and the write/acknowledge loop
//! that assembles a fragmented reply. Nothing here returns a bridge error to
//! its caller; failures become a boolean, a result string, or a log line.

use crate::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, ScannedDevice, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{GattSession, DEFAULT_OPERATION_TIMEOUT};
use crate::infrastructure::bluetooth::error::{BleError, BleResult};
use crate::infrastructure::bluetooth::native::{Characteristic, NativeGatt, NativeScanner};
use crate::infrastructure::bluetooth::protocol::{
    self, ACK_TOKEN, COMMAND_CHAR_UUID, NOT_CONNECTED_MESSAGE, NO_CHARACTERISTIC,
    TIMEOUT_MESSAGE, UNABLE_TO_EXECUTE_MESSAGE,
};
use crate::infrastructure::bluetooth::scanner::{BleScanner, DEFAULT_SCAN_DURATION};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on reply fragments per command
pub const DEFAULT_MAX_REPLY_ROUNDS: usize = 256;

/// Runtime configuration of the service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub command_char_uuid: Uuid,
    pub operation_timeout: Duration,
    pub scan_duration: Duration,
    pub max_reply_rounds: usize,
    /// Space separated device names accepted while scanning
    pub device_name_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_char_uuid: COMMAND_CHAR_UUID,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            scan_duration: DEFAULT_SCAN_DURATION,
            max_reply_rounds: DEFAULT_MAX_REPLY_ROUNDS,
            device_name_filter: String::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let command_char_uuid = Uuid::parse_str(&settings.ble_command_char_uuid).map_err(|e| {
            anyhow::anyhow!(
                "Invalid command characteristic UUID {:?}: {}",
                settings.ble_command_char_uuid,
                e
            )
        })?;
        if settings.max_reply_rounds == 0 {
            anyhow::bail!("max_reply_rounds must be at least 1");
        }
        if settings.operation_timeout_ms == 0 {
            anyhow::bail!("operation_timeout_ms must be at least 1");
        }

        Ok(Self {
            command_char_uuid,
            operation_timeout: Duration::from_millis(settings.operation_timeout_ms),
            scan_duration: Duration::from_millis(settings.scan_duration_ms),
            max_reply_rounds: settings.max_reply_rounds,
            device_name_filter: settings.device_name_filter.clone(),
        })
    }
}

/// Background command bookkeeping. Each started command gets a new
/// generation; only the current generation may clear the busy flag.
#[derive(Default)]
struct CommandSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    session: Arc<GattSession>,
    scanner: BleScanner,
    config: ServiceConfig,
    /// Held for a whole command exchange
    exchange: tokio::sync::Mutex<()>,
    command: Mutex<CommandSlot>,
    busy: AtomicBool,
    status_task: JoinHandle<()>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BluetoothService {
    /// Create a new Bluetooth service. Must be called from within a tokio
    /// runtime.
    pub fn new(
        gatt: Arc<dyn NativeGatt>,
        scanner: Arc<dyn NativeScanner>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ServiceConfig,
    ) -> Self {
        let session = Arc::new(GattSession::with_timeout(gatt, config.operation_timeout));
        let scanner = BleScanner::new(scanner, event_sender.clone(), config.scan_duration);
        scanner.set_filter_name(&config.device_name_filter);
        let status_task = spawn_status_forwarder(&session, event_sender.clone());

        Self {
            session,
            scanner,
            config,
            exchange: tokio::sync::Mutex::new(()),
            command: Mutex::new(CommandSlot::default()),
            busy: AtomicBool::new(false),
            status_task,
            event_sender,
        }
    }

    pub fn session(&self) -> &GattSession {
        &self.session
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start scanning for devices; a second call while scanning stops the scan
    pub fn start_scan(&self) -> bool {
        match self.scanner.start_scan() {
            Ok(scanning) => scanning,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
                false
            }
        }
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan();
    }

    pub fn set_filter_name(&self, names: &str) {
        self.scanner.set_filter_name(names);
    }

    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.scanner.devices()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Connect, discover services and subscribe to the command characteristic.
    ///
    /// Any existing session is closed first. Returns false on any failure,
    /// including a peripheral without the command characteristic.
    pub async fn connect_to_device(&self, device: &ScannedDevice) -> bool {
        self.scanner.stop_scan();
        if self.session.is_active() {
            info!("Closing the current session before connecting");
            self.disconnect_from_device().await;
        }

        let _ = self
            .event_sender
            .send(AppEvent::ConnectionStatus(ConnectionStatus::Connecting));
        self.send_log(
            &format!("Connecting to {}...", device.display_name()),
            MessageSeverity::Info,
        );

        match self.establish(device).await {
            Ok(()) => {
                self.send_log(
                    &format!("Connected to {}", device.display_name()),
                    MessageSeverity::Success,
                );
                true
            }
            Err(e) => {
                error!("Connection to {} failed: {:#}", device.address, e);
                self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                if self.session.is_active() {
                    if let Err(e) = self.session.disconnect().await {
                        warn!("Cleanup disconnect failed: {}", e);
                        self.send_log(
                            &format!("Cleanup disconnect failed: {}", e),
                            MessageSeverity::Warning,
                        );
                    }
                }
                let _ = self
                    .event_sender
                    .send(AppEvent::ConnectionStatus(ConnectionStatus::Error));
                false
            }
        }
    }

    async fn establish(&self, device: &ScannedDevice) -> Result<()> {
        self.session.connect(device).await?;

        let services = self.session.discover_services().await?;
        let characteristic = services
            .iter()
            .find_map(|service| service.characteristic(self.config.command_char_uuid))
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Command characteristic {} not found",
                    self.config.command_char_uuid
                )
            })?;
        info!("Found command characteristic");

        self.session.set_notify(&characteristic, true).await?;
        Ok(())
    }

    /// Disconnect from the current device. Errors are logged, never returned.
    pub async fn disconnect_from_device(&self) {
        self.cancel_command();
        match self.session.disconnect().await {
            Ok(()) => debug!("Disconnect complete"),
            Err(e) => {
                warn!("Disconnect failed: {}", e);
                self.send_log(&format!("Disconnect failed: {}", e), MessageSeverity::Warning);
            }
        }
    }

    /// Connect to `device` when idle, disconnect otherwise. Returns whether a
    /// session is up afterwards.
    pub async fn toggle_device(&self, device: &ScannedDevice) -> bool {
        if self.session.is_connected() {
            self.disconnect_from_device().await;
            false
        } else {
            self.connect_to_device(device).await
        }
    }

    /// Send `text` and return the assembled reply, or a message describing
    /// why there is none.
    pub async fn send_cmd(&self, text: &str) -> String {
        let _exchange = self.exchange.lock().await;

        let characteristic = match self
            .session
            .find_characteristic(self.config.command_char_uuid)
        {
            Some(characteristic) => characteristic,
            None => {
                warn!("No command characteristic, is the device subscribed?");
                return NO_CHARACTERISTIC.to_string();
            }
        };

        match self.exchange(&characteristic, text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Command {:?} failed: {}", text, e);
                match e {
                    BleError::Timeout(_) => TIMEOUT_MESSAGE.to_string(),
                    BleError::IllegalState => NOT_CONNECTED_MESSAGE.to_string(),
                    BleError::MaxRoundsExceeded(rounds) => {
                        format!("Protocol error: reply exceeded {} rounds", rounds)
                    }
                    _ => UNABLE_TO_EXECUTE_MESSAGE.to_string(),
                }
            }
        }
    }

    async fn exchange(&self, characteristic: &Characteristic, text: &str) -> BleResult<String> {
        self.session.discard_notifications();
        self.session.write_char(characteristic, text).await?;

        let mut reply = String::new();
        for round in 1..=self.config.max_reply_rounds {
            let notified = match self.session.wait_for_change(characteristic).await {
                Ok(fragment) => Some(fragment),
                Err(BleError::Timeout(_)) => None,
                Err(e) => return Err(e),
            };
            let fragment = match notified {
                Some(fragment) if protocol::is_complete(&fragment) => fragment,
                _ => self.session.read_char(characteristic).await?,
            };
            debug!("Fragment {}: {:?}", round, fragment);

            reply.push_str(&fragment);
            if protocol::is_terminal(&fragment) {
                return Ok(reply);
            }
            self.session.write_char(characteristic, ACK_TOKEN).await?;
        }

        Err(BleError::MaxRoundsExceeded(self.config.max_reply_rounds))
    }

    /// Run a command on a background task and publish its user-facing result
    /// as [`AppEvent::CommandResult`]. Returns false while another command is
    /// still running.
    pub fn send_command(self: &Arc<Self>, text: impl Into<String>) -> bool {
        let mut slot = self.command_slot();
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Command already in progress");
            return false;
        }
        let _ = self.event_sender.send(AppEvent::CommandBusy(true));
        slot.generation += 1;
        let generation = slot.generation;

        let text = text.into();
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let reply = service.send_cmd(&text).await;
            let _ = service
                .event_sender
                .send(AppEvent::CommandResult(protocol::describe_reply(&reply)));
            service.finish_command(generation);
        });
        if let Some(previous) = slot.handle.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Clear the busy flag on behalf of command `generation`. A command that
    /// was cancelled in the meantime no longer owns the flag.
    fn finish_command(&self, generation: u64) {
        let slot = self.command_slot();
        if slot.generation == generation {
            self.release_busy();
        } else {
            debug!("Command {} finished after being cancelled", generation);
        }
    }

    fn release_busy(&self) {
        if self.busy.swap(false, Ordering::SeqCst) {
            let _ = self.event_sender.send(AppEvent::CommandBusy(false));
        }
    }

    /// Abort a running background command
    fn cancel_command(&self) {
        let mut slot = self.command_slot();
        if let Some(handle) = slot.handle.take() {
            if !handle.is_finished() {
                info!("Cancelling running command");
            }
            handle.abort();
            slot.generation += 1;
            self.release_busy();
        }
    }

    /// Stop scanning, cancel background work and disconnect
    pub async fn shutdown(&self) {
        self.scanner.stop_scan();
        self.disconnect_from_device().await;
    }

    fn command_slot(&self) -> MutexGuard<'_, CommandSlot> {
        self.command.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        self.status_task.abort();
        if let Some(handle) = self.command_slot().handle.take() {
            handle.abort();
        }
    }
}

/// Publish connected-flag transitions, including drops nobody asked for
fn spawn_status_forwarder(
    session: &GattSession,
    event_sender: mpsc::UnboundedSender<AppEvent>,
) -> JoinHandle<()> {
    let mut connected = session.subscribe_connected();
    tokio::spawn(async move {
        while connected.changed().await.is_ok() {
            let is_connected = *connected.borrow_and_update();
            let status = if is_connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            if event_sender.send(AppEvent::ConnectionStatus(status)).is_err() {
                break;
            }
            if !is_connected {
                let _ = event_sender.send(AppEvent::LogMessage(StatusMessage {
                    message: "Disconnected".to_string(),
                    severity: MessageSeverity::Info,
                }));
            }
        }
    })
}
