//! Discovery state: watcher status and the caller-visible device set.
//! Host-driven: the host feeds watcher events and forwards the returned changes.

use crate::device::{DeviceId, DeviceUpdate, DiscoveredDevice};

/// Association-endpoint protocol id for Bluetooth classic devices. This is the
/// generic discovery filter, not the chat service UUID.
pub const BLUETOOTH_CLASSIC_PROTOCOL_ID: &str = "e0cbf06c-cd8b-4647-bb8a-263b43f0f974";

/// Watcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Stopped,
    Watching { enumeration_complete: bool },
}

/// Event delivered by a running device watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Added(DiscoveredDevice),
    Updated(DeviceUpdate),
    Removed(DeviceId),
    EnumerationCompleted,
    Stopped,
}

/// Change to the visible device set, for the host to forward to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListChange {
    Added(DiscoveredDevice),
    Updated(DiscoveredDevice),
    Removed(DeviceId),
    EnumerationCompleted { count: usize },
    Cleared,
}

/// What a start/stop toggle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    Stopped,
}

/// Owns the visible device set. Callers only ever see snapshots.
#[derive(Debug)]
pub struct Discovery {
    status: WatcherStatus,
    devices: Vec<DiscoveredDevice>,
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            status: WatcherStatus::Stopped,
            devices: Vec::new(),
        }
    }

    pub fn status(&self) -> WatcherStatus {
        self.status
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.status, WatcherStatus::Watching { .. })
    }

    /// Start watching. Returns false if a watcher is already running.
    pub fn start(&mut self) -> bool {
        if self.is_watching() {
            return false;
        }
        self.status = WatcherStatus::Watching {
            enumeration_complete: false,
        };
        true
    }

    /// Stop watching. Idempotent; returns false if already stopped.
    /// The device set is cleared when the watcher reports [`WatcherEvent::Stopped`].
    pub fn stop(&mut self) -> bool {
        if !self.is_watching() {
            return false;
        }
        self.status = WatcherStatus::Stopped;
        true
    }

    /// Start/Stop button semantics: start when stopped, otherwise stop.
    pub fn toggle(&mut self) -> Toggle {
        if self.is_watching() {
            self.stop();
            Toggle::Stopped
        } else {
            self.start();
            Toggle::Started
        }
    }

    /// Apply one watcher event. Returns the visible change, if any.
    pub fn apply(&mut self, event: WatcherEvent) -> Option<DeviceListChange> {
        match event {
            WatcherEvent::Added(device) => {
                if !self.is_watching() || !device.has_display_name() {
                    return None;
                }
                if let Some(existing) = self.devices.iter_mut().find(|d| d.id == device.id) {
                    *existing = device.clone();
                    return Some(DeviceListChange::Updated(device));
                }
                self.devices.push(device.clone());
                Some(DeviceListChange::Added(device))
            }
            WatcherEvent::Updated(update) => {
                if !self.is_watching() {
                    return None;
                }
                let existing = self.devices.iter_mut().find(|d| d.id == update.id)?;
                existing.apply(&update);
                Some(DeviceListChange::Updated(existing.clone()))
            }
            WatcherEvent::Removed(id) => {
                let idx = self.devices.iter().position(|d| d.id == id)?;
                self.devices.remove(idx);
                Some(DeviceListChange::Removed(id))
            }
            WatcherEvent::EnumerationCompleted => {
                if let WatcherStatus::Watching {
                    enumeration_complete,
                } = &mut self.status
                {
                    *enumeration_complete = true;
                    return Some(DeviceListChange::EnumerationCompleted {
                        count: self.devices.len(),
                    });
                }
                None
            }
            WatcherEvent::Stopped => {
                self.status = WatcherStatus::Stopped;
                self.devices.clear();
                Some(DeviceListChange::Cleared)
            }
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| &d.id == id)
    }

    /// Read-only copy of the visible set, in discovery order.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}
