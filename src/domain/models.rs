use serde::{Deserialize, Serialize};

/// A peripheral reported by the platform scanner.
///
/// Two reports describe the same device when their addresses match; the name
/// and signal strength may change between advertisements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedDevice {
    pub name: Option<String>,
    pub address: String,
    pub signal_strength: i16,
}

impl ScannedDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
            signal_strength: 0,
        }
    }

    /// Name for display, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for ScannedDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ScannedDevice {}

/// State published by the bluetooth service for whoever is observing it.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    ScanningChanged(bool),
    DevicesChanged(Vec<ScannedDevice>),
    CommandBusy(bool),
    CommandResult(String),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
