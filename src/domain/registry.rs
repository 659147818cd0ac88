//! Device registry for a single scan window.

use crate::domain::models::{DeviceAddress, PeripheralIdentity, ScanSnapshot};
use std::collections::HashSet;

/// Deduplicated, first-seen ordered set of discovered peripherals.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<PeripheralIdentity>,
    seen: HashSet<DeviceAddress>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a peripheral. Returns false if its address was already known;
    /// the first identity seen for an address is kept as-is.
    pub fn admit(&mut self, device: PeripheralIdentity) -> bool {
        if !self.seen.insert(device.address) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.seen.clear();
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.devices.clone()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
