//! Device discovery controller: owns the radio watcher and feeds its events
//! through the core `Discovery` set into the caller's event channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rfchat_core::discovery::BLUETOOTH_CLASSIC_PROTOCOL_ID;
use rfchat_core::{DiscoveredDevice, Discovery, Toggle, WatcherEvent, WatcherStatus};
use tokio::task::JoinHandle;

use crate::events::EventSender;
use crate::radio::{DeviceWatcher, Radio, RadioError};

pub struct DiscoveryController {
    radio: Arc<dyn Radio>,
    events: EventSender,
    devices: Arc<Mutex<Discovery>>,
    /// Task draining the current watcher. Also serializes start/stop.
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

fn lock(devices: &Mutex<Discovery>) -> MutexGuard<'_, Discovery> {
    devices.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryController {
    pub fn new(radio: Arc<dyn Radio>, events: EventSender) -> Self {
        Self {
            radio,
            events,
            devices: Arc::new(Mutex::new(Discovery::new())),
            pump: tokio::sync::Mutex::new(None),
        }
    }

    /// Start watching. Returns false if already watching.
    pub async fn start(&self) -> Result<bool, RadioError> {
        let mut pump = self.pump.lock().await;
        if lock(&self.devices).is_watching() {
            return Ok(false);
        }
        let watcher = self.radio.watch(BLUETOOTH_CLASSIC_PROTOCOL_ID).await?;
        lock(&self.devices).start();
        tracing::info!("discovery started");
        *pump = Some(tokio::spawn(drain(
            watcher,
            self.devices.clone(),
            self.events.clone(),
        )));
        Ok(true)
    }

    /// Stop watching and clear the visible set. Idempotent; returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let mut pump = self.pump.lock().await;
        if let Some(task) = pump.take() {
            task.abort();
        }
        let stopped = finish(&self.devices, &self.events);
        if stopped {
            tracing::info!("discovery stopped");
        }
        stopped
    }

    /// Start when stopped, stop when watching.
    pub async fn toggle(&self) -> Result<Toggle, RadioError> {
        if self.is_watching() {
            self.stop().await;
            Ok(Toggle::Stopped)
        } else {
            self.start().await?;
            Ok(Toggle::Started)
        }
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.devices).is_watching()
    }

    pub fn status(&self) -> WatcherStatus {
        lock(&self.devices).status()
    }

    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        lock(&self.devices).snapshot()
    }
}

/// Apply the stop to the device set and report the cleared list, once.
fn finish(devices: &Mutex<Discovery>, events: &EventSender) -> bool {
    let change = {
        let mut d = lock(devices);
        if !d.stop() {
            return false;
        }
        d.apply(WatcherEvent::Stopped)
    };
    if let Some(change) = change {
        events.emit(change.into());
    }
    true
}

async fn drain(mut watcher: DeviceWatcher, devices: Arc<Mutex<Discovery>>, events: EventSender) {
    while let Some(event) = watcher.next().await {
        if event == WatcherEvent::Stopped {
            break;
        }
        let change = lock(&devices).apply(event);
        if let Some(change) = change {
            events.emit(change.into());
        }
    }
    tracing::debug!("watcher ended");
    finish(&devices, &events);
}
