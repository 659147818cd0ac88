//! Bluetooth Module
//!
//! BLE central link to a single hover robot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Main coordinator - public API for the application)     │
//! └───────┬──────────────┬──────────────┬──────────────┬────┘
//!         │              │              │              │
//!         ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌─────────────┐
//! │  Scanner  │  │ Connection │  │ Dispatcher │  │Notifications│
//! │           │  │   actor    │  │            │  │             │
//! │ - window  │  │ - states   │  │ - 1 write  │  │ - length    │
//! │ - registry│  │ - GATT     │  │   in flight│  │   filter    │
//! │           │  │   discovery│  │ - coalesce │  │ - decode    │
//! └─────┬─────┘  └─────┬──────┘  └─────┬──────┘  └──────┬──────┘
//!       └──────────────┴───────┬───────┴────────────────┘
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │ BleTransport (winrt / │
//!                  │ simulated)            │
//!                  └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and the binary frame codec
//! - [`transport`] - Platform BLE abstraction and its event type
//! - [`scanner`] - Time-bounded device discovery
//! - [`connection`] - Connection state machine actor
//! - [`dispatcher`] - Serialized command writes
//! - [`notifications`] - Telemetry notification pipeline
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod notifications;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod status;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use error::{BleError, DispatchError};
pub use scanner::ScanOutcome;
pub use service::BluetoothService;
pub use transport::{BleTransport, TransportEvent};
