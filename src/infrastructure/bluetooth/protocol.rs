//! Hover Robot Protocol
//!
//! GATT identifiers and the binary frames exchanged with the robot firmware.
//! Everything here is pure: no I/O, no logging.
//!
//! ## Outbound frames (written to [`WRITE_CHAR_UUID`])
//!
//! All multi-byte fields are little-endian.
//!
//! ```text
//! AxisControl, 5 bytes
//! [0]     : 0x01 (FRAME_AXIS_CONTROL)
//! [1-2]   : x (i16, -100..=100)
//! [3-4]   : y (i16, -100..=100)
//!
//! PidSettings, 21 bytes
//! [0]     : 0x02 (FRAME_PID_SETTINGS)
//! [1-4]   : kp (f32)
//! [5-8]   : ki (f32)
//! [9-12]  : kd (f32)
//! [13-16] : center angle (f32)
//! [17-20] : safety limits (f32)
//! ```
//!
//! ## Inbound telemetry (notified on [`NOTIFY_CHAR_UUID`])
//!
//! ```text
//! [0-3]   : pitch (f32)
//! [4-7]   : roll (f32)
//! [8-11]  : yaw (f32)
//! [12-13] : left wheel speed (i16)
//! [14-15] : right wheel speed (i16)
//! [16-35] : optional PID echo: kp, ki, kd, center angle, safety limits (f32)
//! ```
//!
//! Each notification is one complete frame; trailing bytes past the known
//! layout are ignored.

use crate::domain::models::{AxisControl, OutboundCommand, PidSettings, TelemetryFrame};
use thiserror::Error;
use uuid::Uuid;

/// Robot control service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000abf0_0000_1000_8000_00805f9b34fb);

/// Readable characteristic
pub const READ_CHAR_UUID: Uuid = Uuid::from_u128(0x0000abf1_0000_1000_8000_00805f9b34fb);

/// Telemetry notifications
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000abf2_0000_1000_8000_00805f9b34fb);

/// Command writes
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000abf3_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Shortest notification that carries a full telemetry frame.
pub const MIN_FRAME_LEN: usize = 16;

/// Telemetry length from which the PID echo is present.
pub const PID_ECHO_FRAME_LEN: usize = 36;

pub const FRAME_AXIS_CONTROL: u8 = 0x01;
pub const FRAME_PID_SETTINGS: u8 = 0x02;

pub const AXIS_CONTROL_LEN: usize = 5;
pub const PID_SETTINGS_LEN: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },
}

/// Encodes a joystick sample. Out-of-range axes are clamped.
pub fn encode_axis_control(x: i16, y: i16) -> Vec<u8> {
    let axis = AxisControl::new(x, y);
    let mut frame = Vec::with_capacity(AXIS_CONTROL_LEN);
    frame.push(FRAME_AXIS_CONTROL);
    frame.extend_from_slice(&axis.x.to_le_bytes());
    frame.extend_from_slice(&axis.y.to_le_bytes());
    frame
}

pub fn encode_pid_settings(kp: f32, ki: f32, kd: f32, center: f32, safety: f32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PID_SETTINGS_LEN);
    frame.push(FRAME_PID_SETTINGS);
    for value in [kp, ki, kd, center, safety] {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame
}

pub fn encode_command(command: &OutboundCommand) -> Vec<u8> {
    match command {
        OutboundCommand::AxisControl(axis) => encode_axis_control(axis.x, axis.y),
        OutboundCommand::PidSettings(pid) => encode_pid_settings(
            pid.kp,
            pid.ki,
            pid.kd,
            pid.center_angle,
            pid.safety_limits,
        ),
    }
}

/// Decodes one telemetry notification.
///
/// Never fails for inputs of [`MIN_FRAME_LEN`] bytes or more.
pub fn decode_frame(bytes: &[u8]) -> Result<TelemetryFrame, CodecError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(CodecError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let pid = if bytes.len() >= PID_ECHO_FRAME_LEN {
        Some(PidSettings {
            kp: read_f32(bytes, 16),
            ki: read_f32(bytes, 20),
            kd: read_f32(bytes, 24),
            center_angle: read_f32(bytes, 28),
            safety_limits: read_f32(bytes, 32),
        })
    } else {
        None
    };

    Ok(TelemetryFrame {
        pitch: read_f32(bytes, 0),
        roll: read_f32(bytes, 4),
        yaw: read_f32(bytes, 8),
        speed_left: i16::from_le_bytes([bytes[12], bytes[13]]),
        speed_right: i16::from_le_bytes([bytes[14], bytes[15]]),
        pid,
    })
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
