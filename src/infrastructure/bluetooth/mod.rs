//! Bluetooth Module
//!
//! Command exchange with an embedded peripheral over a single GATT link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Command engine - public API for the application)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - BLE     │  │ - Session  │  │ - UUIDs   │
//! │ discovery │  │ - Bounded  │  │ - Framing │
//! │           │  │   waits    │  │ - Errors  │
//! └─────┬─────┘  └─────┬──────┘  └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │   Native (platform stack)   │
//! │ NativeScanner / NativeGatt  │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`native`] - Capabilities the platform stack must provide
//! - [`connection`] - Callback-to-async bridge over one GATT session
//! - [`protocol`] - Wire constants, fragment rules and peripheral errors
//! - [`scanner`] - BLE device discovery
//! - [`service`] - Connect sequence and the command/acknowledge loop
//! - [`simulated`] - In-process peripheral for demos and tests

pub mod connection;
pub mod error;
mod mailbox;
pub mod native;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

pub use connection::GattSession;
pub use error::{BleError, BleResult};
pub use scanner::BleScanner;
pub use service::{BluetoothService, ServiceConfig};
