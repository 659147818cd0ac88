//! BLE central link to a self-balancing hover robot.
//!
//! [`BluetoothService`] discovers the robot, manages the single GATT
//! connection, writes joystick and PID commands one at a time, and streams
//! decoded telemetry.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    AxisControl, ConnectionStatus, DeviceAddress, OutboundCommand, PeripheralIdentity,
    PidSettings, ScanSnapshot, TelemetryFrame,
};
pub use infrastructure::bluetooth::{BleError, BluetoothService, DispatchError, ScanOutcome};
