//! Bridge error kinds
//!
//! `Timeout` and `IllegalState` are the two conditions the bridge itself
//! produces; the service turns all of them into result strings or booleans.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// No event arrived before the operation's deadline
    #[error("Operation's timeout is over ({0:?})")]
    Timeout(Duration),

    /// Operation attempted without an active session
    #[error("Gatt server is not available. Maybe device is disconnected")]
    IllegalState,

    /// The peripheral kept sending non-terminal fragments
    #[error("Reply exceeded {0} rounds without a terminal fragment")]
    MaxRoundsExceeded(usize),

    /// The characteristic has no client configuration descriptor
    #[error("Characteristic has no descriptor {0}")]
    DescriptorNotFound(Uuid),

    /// The platform stack refused to start the operation
    #[error("Native GATT operation rejected: {0}")]
    Native(String),
}

pub type BleResult<T> = std::result::Result<T, BleError>;
