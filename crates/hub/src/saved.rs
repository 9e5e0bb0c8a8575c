//! Saved printers used for auto-connect and replay.
//!
//! How saved devices are stored is up to the embedding application; the hub
//! only reads them through [`SavedDeviceSource`]. [`SavedDeviceList`] is an
//! in-memory source for applications that keep the list themselves.

use std::sync::{PoisonError, RwLock};

use protocol::{CheckCode, DeviceAddress, DeviceType};
use serde::{Deserialize, Serialize};

/// A printer the operator connected to before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub address: DeviceAddress,
    pub device_type: DeviceType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub check_code: Option<CheckCode>,
}

impl SavedDevice {
    pub fn new(address: DeviceAddress, device_type: DeviceType) -> Self {
        Self {
            address,
            device_type,
            name: None,
            check_code: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_check_code(mut self, code: CheckCode) -> Self {
        self.check_code = Some(code);
        self
    }
}

/// Read-only access to the saved-device list.
pub trait SavedDeviceSource: Send + Sync {
    /// Every saved device, in the order they should be reconnected.
    fn devices(&self) -> Vec<SavedDevice>;

    /// The device used most recently, if known.
    fn last_used(&self) -> Option<SavedDevice>;
}

#[derive(Default)]
struct SavedState {
    devices: Vec<SavedDevice>,
    last_used: Option<DeviceAddress>,
}

/// In-memory saved-device list, keyed by address.
#[derive(Default)]
pub struct SavedDeviceList {
    state: RwLock<SavedState>,
}

impl SavedDeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device, replacing any entry with the same address in place.
    pub fn upsert(&self, device: SavedDevice) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state
            .devices
            .iter_mut()
            .find(|existing| existing.address == device.address)
        {
            Some(existing) => *existing = device,
            None => state.devices.push(device),
        }
    }

    /// Removes a device. Returns the removed entry.
    pub fn remove(&self, address: &DeviceAddress) -> Option<SavedDevice> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let index = state.devices.iter().position(|d| &d.address == address)?;
        if state.last_used.as_ref() == Some(address) {
            state.last_used = None;
        }
        Some(state.devices.remove(index))
    }

    /// Records the most recently used device. Unknown addresses are ignored.
    pub fn mark_used(&self, address: &DeviceAddress) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.devices.iter().any(|d| &d.address == address) {
            state.last_used = Some(address.clone());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<SavedDevice> for SavedDeviceList {
    fn from_iter<I: IntoIterator<Item = SavedDevice>>(iter: I) -> Self {
        let list = Self::new();
        for device in iter {
            list.upsert(device);
        }
        list
    }
}

impl SavedDeviceSource for SavedDeviceList {
    fn devices(&self) -> Vec<SavedDevice> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .clone()
    }

    fn last_used(&self) -> Option<SavedDevice> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let address = state.last_used.as_ref()?;
        state.devices.iter().find(|d| &d.address == address).cloned()
    }
}
