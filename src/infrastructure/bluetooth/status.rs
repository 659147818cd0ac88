//! Connection status stream shared by the scanner and the connection actor.

use crate::domain::models::ConnectionStatus;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug)]
struct HubState {
    /// Last status published by anyone.
    current: ConnectionStatus,
    /// Last status published by the connection actor.
    link: ConnectionStatus,
}

/// Serializes status publication so every subscriber sees the same order.
#[derive(Debug)]
pub struct StatusHub {
    state: Mutex<HubState>,
    tx: broadcast::Sender<ConnectionStatus>,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(HubState {
                current: ConnectionStatus::Uninitialized,
                link: ConnectionStatus::Uninitialized,
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionStatus {
        self.lock().current
    }

    pub fn link(&self) -> ConnectionStatus {
        self.lock().link
    }

    /// Publishes a connection lifecycle transition.
    pub fn publish_link(&self, status: ConnectionStatus) {
        let mut state = self.lock();
        state.link = status;
        state.current = status;
        debug!("Link status -> {:?}", status);
        // No subscribers is fine
        let _ = self.tx.send(status);
    }

    /// Publishes a scan transition. Dropped while a link exists, so scanning
    /// never masks the state of a live connection.
    pub fn publish_scan(&self, status: ConnectionStatus) -> bool {
        let mut state = self.lock();
        if !state.link.is_idle() {
            return false;
        }
        state.current = status;
        debug!("Scan status -> {:?}", status);
        let _ = self.tx.send(status);
        true
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
