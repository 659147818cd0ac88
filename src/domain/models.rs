use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable 48-bit BLE device address.
///
/// Platform handles never leave the transport backend; everything above it
/// compares peripherals by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub fn new(raw: u64) -> Self {
        Self(raw & 0xFFFF_FFFF_FFFF)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// A peripheral observed during a scan window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralIdentity {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralIdentity {
    pub fn new(address: DeviceAddress, name: Option<String>) -> Self {
        Self {
            address,
            name,
            rssi: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Ordered, duplicate-free list of peripherals seen since the last scan start.
pub type ScanSnapshot = Vec<PeripheralIdentity>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Uninitialized,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionStatus {
    /// True while a connection attempt holds the radio.
    pub fn is_establishing(&self) -> bool {
        matches!(self, Self::Connecting | Self::ServiceDiscovery)
    }

    /// True for any state in which a link exists or is being built.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::Connected
        )
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicDirection {
    Read,
    Write,
    Notify,
}

/// A resolved (service, characteristic, direction) triple.
///
/// Only valid for the connection it was resolved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattEndpoint {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub direction: CharacteristicDirection,
}

/// Service as reported by the transport during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Endpoints of the control service found on the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub read: Option<GattEndpoint>,
    pub write: Option<GattEndpoint>,
    pub notify: Option<GattEndpoint>,
}

impl ResolvedEndpoints {
    pub fn is_complete(&self) -> bool {
        self.read.is_some() && self.write.is_some() && self.notify.is_some()
    }
}

/// Joystick sample, both axes in [-100, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisControl {
    pub x: i16,
    pub y: i16,
}

impl AxisControl {
    pub const LIMIT: i16 = 100;

    pub fn new(x: i16, y: i16) -> Self {
        Self {
            x: x.clamp(-Self::LIMIT, Self::LIMIT),
            y: y.clamp(-Self::LIMIT, Self::LIMIT),
        }
    }

    /// Builds a sample from two joystick positions in [0, 100]: throttle on
    /// the vertical stick (0 = top), direction on the horizontal one.
    pub fn from_normalized(throttle: u8, direction: u8) -> Self {
        let y = 100 - i16::from(throttle.min(100)) * 2;
        let x = i16::from(direction.min(100)) * 2 - 100;
        Self::new(x, y)
    }
}

/// Balance controller tuning sent to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidSettings {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub center_angle: f32,
    pub safety_limits: f32,
}

/// How the dispatcher may treat a command that is still waiting for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Only the newest pending value matters.
    Coalescible,
    /// Every command must be written, in order.
    MustDeliver,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutboundCommand {
    AxisControl(AxisControl),
    PidSettings(PidSettings),
}

impl OutboundCommand {
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            Self::AxisControl(_) => DeliveryClass::Coalescible,
            Self::PidSettings(_) => DeliveryClass::MustDeliver,
        }
    }
}

impl From<AxisControl> for OutboundCommand {
    fn from(axis: AxisControl) -> Self {
        Self::AxisControl(axis)
    }
}

impl From<PidSettings> for OutboundCommand {
    fn from(pid: PidSettings) -> Self {
        Self::PidSettings(pid)
    }
}

/// Decoded robot state from one notification.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryFrame {
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
    pub speed_left: i16,
    pub speed_right: i16,
    /// Present when the robot echoes its active tuning.
    pub pid: Option<PidSettings>,
}
