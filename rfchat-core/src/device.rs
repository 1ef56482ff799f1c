//! Nearby devices as reported by the discovery watcher.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, stable device identifier assigned by the radio.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_owned())
    }
}

/// A device visible to the discoverer. Address and connected flag are the
/// extra properties requested from the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: String,
    pub address: Option<String>,
    pub is_connected: Option<bool>,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            is_connected: None,
        }
    }

    /// Blank names are never shown to the user.
    pub fn has_display_name(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// Merge a partial update. Fields absent from the update are kept.
    pub fn apply(&mut self, update: &DeviceUpdate) {
        if let Some(name) = &update.name {
            self.name.clone_from(name);
        }
        if let Some(address) = &update.address {
            self.address = Some(address.clone());
        }
        if let Some(connected) = update.is_connected {
            self.is_connected = Some(connected);
        }
    }
}

/// Partial property change for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub id: DeviceId,
    pub name: Option<String>,
    pub address: Option<String>,
    pub is_connected: Option<bool>,
}

impl DeviceUpdate {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_connected(mut self, connected: bool) -> Self {
        self.is_connected = Some(connected);
        self
    }
}
