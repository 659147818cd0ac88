use crate::domain::models::ConnectionStatus;
use thiserror::Error;

/// Failures of scan, connection and GATT operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    #[error("Radio busy: link is {0:?}")]
    RadioBusy(ConnectionStatus),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No active link")]
    NotConnected,

    #[error("Bluetooth service has shut down")]
    ServiceClosed,
}

impl BleError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Outcome of a command that did not reach the robot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Write endpoint not ready")]
    EndpointNotReady,

    #[error("Superseded by a newer sample")]
    Superseded,

    #[error("Too many settings commands waiting ({0})")]
    QueueFull(usize),

    #[error("Write failed: {0}")]
    Transport(String),

    #[error("Command dispatcher has shut down")]
    Closed,
}

impl From<BleError> for DispatchError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Transport(message) => Self::Transport(message),
            BleError::ServiceClosed => Self::Closed,
            _ => Self::EndpointNotReady,
        }
    }
}
