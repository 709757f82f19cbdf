//! Peripheral Command Protocol
//!
//! Wire contract of the command characteristic. A request is the raw command
//! text. The reply arrives as one or more fragments, by notification or by
//! reading the characteristic; every non-terminal fragment is acknowledged by
//! writing [`ACK_TOKEN`] back before the next one is sent.
//!
//! ```text
//!   host                         peripheral
//!    │ ── write "get" ─────────────▶ │
//!    │ ◀──────── notify "line 1\r\n" │
//!    │ ── write "OK" ──────────────▶ │
//!    │ ◀──────── notify "line 2\r\n" │
//!    │ ── write "OK" ──────────────▶ │
//!    │ ◀──────────────── notify ""   │  terminal
//! ```

use uuid::Uuid;

/// Command characteristic exposed by the peripheral
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fe41_8e22_4541_9d4c_21edae82ed19);

/// Client Characteristic Configuration descriptor
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCC value disabling notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Acknowledgement written after each non-terminal fragment
pub const ACK_TOKEN: &str = "OK";

/// Prefix of peripheral-reported errors
pub const ERROR_PREFIX: &str = "ER:";

/// Marks a fragment as carrying a whole line
pub const LINE_TERMINATOR: &str = "\r\n";

/// Result of a command when the command characteristic was never resolved
pub const NO_CHARACTERISTIC: &str = "none";

pub const TIMEOUT_MESSAGE: &str = "Timeout is over";
pub const NOT_CONNECTED_MESSAGE: &str = "Unable to execute command: not connected";
pub const UNABLE_TO_EXECUTE_MESSAGE: &str = "Unable to execute command";

/// Whether a notification payload holds a full line. Anything else may have
/// been cut short and is re-read from the characteristic.
pub fn is_complete(fragment: &str) -> bool {
    fragment.contains(LINE_TERMINATOR)
}

/// Whether a fragment ends the exchange
pub fn is_terminal(fragment: &str) -> bool {
    fragment.is_empty() || fragment == ACK_TOKEN || fragment.starts_with(ERROR_PREFIX)
}

/// Errors the reference firmware reports through `ER:` replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    WrongData,
    UnsupportedCommand,
    Protocol,
    Other(String),
}

impl PeripheralError {
    /// Recognize an `ER:` reply; `None` for ordinary data
    pub fn parse(reply: &str) -> Option<Self> {
        let payload = reply.strip_prefix(ERROR_PREFIX)?.trim();
        Some(match payload {
            "Wrong data" => Self::WrongData,
            "No support command" => Self::UnsupportedCommand,
            "Protocol error!" => Self::Protocol,
            other => Self::Other(other.to_string()),
        })
    }

    /// Text as the peripheral sends it
    pub fn wire_text(&self) -> String {
        let payload = match self {
            Self::WrongData => "Wrong data",
            Self::UnsupportedCommand => "No support command",
            Self::Protocol => "Protocol error!",
            Self::Other(payload) => payload,
        };
        format!("{} {}", ERROR_PREFIX, payload)
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::WrongData => "Wrong data".to_string(),
            Self::UnsupportedCommand => "Command not supported".to_string(),
            Self::Protocol => "Protocol error".to_string(),
            Self::Other(payload) => format!("Peripheral error: {}", payload),
        }
    }
}

/// Turn a raw command reply into the text shown to the user
pub fn describe_reply(reply: &str) -> String {
    match PeripheralError::parse(reply) {
        Some(error) => error.user_message(),
        None => reply.to_string(),
    }
}
