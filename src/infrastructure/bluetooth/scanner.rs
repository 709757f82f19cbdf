//! BLE Scanner Module
//!
//! Collects advertising peripherals into a de-duplicated device list,
//! optionally restricted to a set of device names.

use crate::domain::models::{AppEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::infrastructure::bluetooth::error::BleResult;
use crate::infrastructure::bluetooth::native::{NativeScanner, ScanCallback};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long a scan runs when nobody stops it
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Scan state reachable from the native scan callback
struct ScanShared {
    devices: Mutex<Vec<ScannedDevice>>,
    name_filter: Mutex<Option<Vec<String>>>,
    scanning: AtomicBool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ScanShared {
    fn devices(&self) -> MutexGuard<'_, Vec<ScannedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_filter(&self) -> MutexGuard<'_, Option<Vec<String>>> {
        self.name_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts(&self, device: &ScannedDevice) -> bool {
        match self.name_filter().as_ref() {
            Some(names) => device
                .name
                .as_deref()
                .is_some_and(|name| names.iter().any(|allowed| allowed == name)),
            None => true,
        }
    }

    fn reset_devices(&self) {
        self.devices().clear();
        let _ = self.event_sender.send(AppEvent::DevicesChanged(Vec::new()));
    }

    /// Stop the native scan if one is running
    fn halt(&self, native: &dyn NativeScanner) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            native.stop_le_scan();
            info!("Scan stopped");
            let _ = self.event_sender.send(AppEvent::ScanningChanged(false));
            let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
                message: "Scan stopped.".to_string(),
                severity: MessageSeverity::Info,
            }));
        }
    }
}

impl ScanCallback for ScanShared {
    fn on_device_found(&self, device: ScannedDevice) {
        if !self.scanning.load(Ordering::SeqCst) || !self.accepts(&device) {
            return;
        }

        let snapshot = {
            let mut devices = self.devices();
            if devices.contains(&device) {
                return;
            }
            debug!("Found {} ({})", device.display_name(), device.address);
            devices.push(device);
            devices.clone()
        };
        let _ = self.event_sender.send(AppEvent::DevicesChanged(snapshot));
    }
}

/// BLE Scanner for discovering peripherals
pub struct BleScanner {
    native: Arc<dyn NativeScanner>,
    shared: Arc<ScanShared>,
    scan_duration: Duration,
    auto_stop: Mutex<Option<JoinHandle<()>>>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(
        native: Arc<dyn NativeScanner>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        scan_duration: Duration,
    ) -> Self {
        Self {
            native,
            shared: Arc::new(ScanShared {
                devices: Mutex::new(Vec::new()),
                name_filter: Mutex::new(None),
                scanning: AtomicBool::new(false),
                event_sender,
            }),
            scan_duration,
            auto_stop: Mutex::new(None),
        }
    }

    /// Start scanning, or stop if a scan is already running.
    ///
    /// Every start clears the device list. The scan stops by itself after the
    /// configured duration. Returns whether a scan is running afterwards.
    /// Must be called from within a tokio runtime.
    pub fn start_scan(&self) -> BleResult<bool> {
        if self.is_scanning() {
            self.stop_scan();
            return Ok(false);
        }

        self.shared.reset_devices();
        self.shared.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.native.start_le_scan(self.shared.clone()) {
            self.shared.scanning.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("Scanning for {:?}", self.scan_duration);
        let _ = self.shared.event_sender.send(AppEvent::ScanningChanged(true));
        let _ = self.shared.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: "Scanning for devices...".to_string(),
            severity: MessageSeverity::Info,
        }));

        let native = self.native.clone();
        let shared = self.shared.clone();
        let duration = self.scan_duration;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            debug!("Scan duration elapsed");
            shared.halt(native.as_ref());
        });
        if let Some(previous) = self.auto_stop().replace(handle) {
            previous.abort();
        }

        Ok(true)
    }

    /// Stop scanning
    pub fn stop_scan(&self) {
        if let Some(handle) = self.auto_stop().take() {
            handle.abort();
        }
        self.shared.halt(self.native.as_ref());
    }

    /// Accept only devices whose name is one of the space separated `names`.
    /// A blank string accepts every device.
    pub fn set_filter_name(&self, names: &str) {
        let names: Vec<String> = names.split_whitespace().map(str::to_string).collect();
        info!("Device name filter: {:?}", names);
        *self.shared.name_filter() = if names.is_empty() { None } else { Some(names) };
    }

    /// Devices found by the current (or last) scan, in discovery order
    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.shared.devices().clone()
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    fn auto_stop(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.auto_stop.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::SimulatedPeripheral;
    use tokio::time::sleep;

    fn devices() -> Vec<ScannedDevice> {
        vec![
            ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01"),
            ScannedDevice::new("Thermostat", "24:0A:C4:00:00:02"),
        ]
    }

    fn scanner(peripheral: &SimulatedPeripheral) -> (BleScanner, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scanner = BleScanner::new(Arc::new(peripheral.clone()), tx, DEFAULT_SCAN_DURATION);
        (scanner, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_collects_devices() {
        let peripheral = SimulatedPeripheral::new(devices());
        let (scanner, _rx) = scanner(&peripheral);

        assert!(scanner.start_scan().unwrap());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(scanner.devices(), devices());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_reports_are_ignored() {
        let peripheral = SimulatedPeripheral::new(Vec::new());
        let (scanner, _rx) = scanner(&peripheral);

        scanner.start_scan().unwrap();
        peripheral.advertise(ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01"));
        peripheral.advertise(ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01"));
        assert_eq!(scanner.devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_filter() {
        let peripheral = SimulatedPeripheral::new(devices());
        let (scanner, _rx) = scanner(&peripheral);
        scanner.set_filter_name("MyESP32 Gateway");

        scanner.start_scan().unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(
            scanner.devices(),
            vec![ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01")]
        );

        scanner.set_filter_name("  ");
        peripheral.advertise(ScannedDevice::new("Thermostat", "24:0A:C4:00:00:02"));
        assert_eq!(scanner.devices().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_toggles_off_and_next_start_resets() {
        let peripheral = SimulatedPeripheral::new(devices());
        let (scanner, _rx) = scanner(&peripheral);

        assert!(scanner.start_scan().unwrap());
        sleep(Duration::from_secs(1)).await;
        assert!(!scanner.start_scan().unwrap());
        assert!(!scanner.is_scanning());
        assert!(!peripheral.is_scanning());
        assert_eq!(scanner.devices().len(), 2);

        assert!(scanner.start_scan().unwrap());
        assert!(scanner.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_duration() {
        let peripheral = SimulatedPeripheral::new(devices());
        let (scanner, mut rx) = scanner(&peripheral);

        scanner.start_scan().unwrap();
        sleep(Duration::from_secs(9)).await;
        assert!(scanner.is_scanning());
        sleep(Duration::from_secs(2)).await;
        assert!(!scanner.is_scanning());
        assert!(!peripheral.is_scanning());

        let mut scanning = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ScanningChanged(value) = event {
                scanning.push(value);
            }
        }
        assert_eq!(scanning, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_auto_stop() {
        let peripheral = SimulatedPeripheral::new(devices());
        let (scanner, _rx) = scanner(&peripheral);

        scanner.start_scan().unwrap();
        sleep(Duration::from_secs(5)).await;
        scanner.stop_scan();
        assert!(scanner.start_scan().unwrap());
        sleep(Duration::from_secs(6)).await;
        // The first scan's timer must not end the second scan early
        assert!(scanner.is_scanning());
    }
}
