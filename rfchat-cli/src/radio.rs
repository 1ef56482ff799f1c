//! Platform radio seam: advertisement, device watching, service lookup and
//! stream opening. Backends: UDP/TCP `lan`, and in-process `loopback` for tests.

pub mod lan;
#[cfg(test)]
pub mod loopback;

use std::io;

use async_trait::async_trait;
use rfchat_core::{DeviceId, SdpAttributes, ServiceRecord, WatcherEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::stream::ChatStream;

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Name other devices see for this one.
    fn local_name(&self) -> String;

    /// Publish `record` and bind its listening endpoint. Dropping the returned
    /// listener stops advertising and releases the endpoint.
    async fn advertise(&self, record: &ServiceRecord)
        -> Result<Box<dyn ServiceListener>, RadioError>;

    /// Start enumerating nearby devices that answer to the discovery protocol
    /// id `filter`. Dropping the watcher stops it.
    async fn watch(&self, filter: &str) -> Result<DeviceWatcher, RadioError>;

    /// Uncached lookup of `service_id` on `device`. `Ok(None)` when not offered.
    async fn find_service(
        &self,
        device: &DeviceId,
        service_id: Uuid,
    ) -> Result<Option<RemoteService>, RadioError>;

    /// Open the duplex stream to a looked-up service.
    async fn open(&self, service: &RemoteService) -> Result<ChatStream, RadioError>;
}

/// Listening endpoint of an advertised service.
#[async_trait]
pub trait ServiceListener: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<ChatStream, RadioError>;
}

/// A service found on a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub device_id: DeviceId,
    pub device_name: String,
    pub service_id: Uuid,
    /// Raw SDP attributes as published by the peer.
    pub attributes: SdpAttributes,
    /// Backend-specific connection endpoint.
    pub endpoint: String,
}

/// Running device watcher. Events arrive from a background task.
#[derive(Debug)]
pub struct DeviceWatcher {
    events: mpsc::UnboundedReceiver<WatcherEvent>,
    task: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn new(events: mpsc::UnboundedReceiver<WatcherEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// Next event, or None once the watcher has shut down.
    pub async fn next(&mut self) -> Option<WatcherEvent> {
        self.events.recv().await
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("the local radio is off or absent")]
    Unavailable,
    #[error("advertisement rejected: {0}")]
    AdvertisementRejected(String),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("service endpoint not found")]
    EndpointNotFound,
    #[error("another connection to this device already exists")]
    AddressInUse,
    #[error("listener closed")]
    ListenerClosed,
    #[error("transport error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for RadioError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                RadioError::EndpointNotFound
            }
            io::ErrorKind::AddrInUse => RadioError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => RadioError::Unavailable,
            _ => RadioError::Io(e),
        }
    }
}
