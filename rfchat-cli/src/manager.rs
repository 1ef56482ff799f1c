//! Connection manager: the listen and connect flows shared by both roles,
//! with service-record validation before any stream is opened.

use std::sync::Arc;

use rfchat_core::service::validate_attributes;
use rfchat_core::{DeviceId, ServiceRecord, ServiceRecordError};

use crate::radio::{Radio, RadioError, RemoteService, ServiceListener};
use crate::stream::ChatStream;

/// Failure of a session command.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("the radio is off or absent; turn it on and retry")]
    RadioUnavailable,
    #[error("advertisement rejected: {0}")]
    AdvertisementRejected(String),
    #[error("the chat service is not running on the remote device")]
    ServiceNotOffered,
    #[error("a connection to this device already exists")]
    DuplicateConnection,
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("invalid service record: {0}")]
    InvalidServiceRecord(#[from] ServiceRecordError),
    #[error("a connection or connection attempt is already active")]
    Busy,
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<RadioError> for ChatError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::Unavailable => ChatError::RadioUnavailable,
            RadioError::AdvertisementRejected(reason) => ChatError::AdvertisementRejected(reason),
            RadioError::DeviceNotFound(id) => ChatError::DeviceNotFound(id),
            RadioError::EndpointNotFound => ChatError::ServiceNotOffered,
            RadioError::AddressInUse => ChatError::DuplicateConnection,
            other @ (RadioError::ListenerClosed | RadioError::Io(_)) => {
                ChatError::Transport(other.to_string())
            }
        }
    }
}

/// A remote service that passed record validation.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub remote: RemoteService,
    /// Name decoded from the peer's service-name attribute.
    pub service_name: String,
}

pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    record: ServiceRecord,
}

impl ConnectionManager {
    pub fn new(radio: Arc<dyn Radio>, record: ServiceRecord) -> Self {
        Self { radio, record }
    }

    pub fn radio(&self) -> &Arc<dyn Radio> {
        &self.radio
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Advertise the service and bind its listening endpoint.
    pub async fn listen(&self) -> Result<Box<dyn ServiceListener>, ChatError> {
        let listener = self.radio.advertise(&self.record).await?;
        tracing::info!(service = %self.record.service_name, "listening");
        Ok(listener)
    }

    /// Uncached service lookup on `device`, then attribute validation.
    pub async fn resolve(&self, device: &DeviceId) -> Result<ResolvedService, ChatError> {
        let remote = self
            .radio
            .find_service(device, self.record.service_id)
            .await?
            .ok_or(ChatError::ServiceNotOffered)?;
        let service_name = validate_attributes(&remote.attributes).map_err(|e| {
            tracing::warn!(%device, error = %e, "peer service record rejected");
            e
        })?;
        Ok(ResolvedService {
            remote,
            service_name,
        })
    }

    pub async fn open(&self, service: &ResolvedService) -> Result<ChatStream, ChatError> {
        let stream = self.radio.open(&service.remote).await?;
        tracing::info!(peer = %service.remote.device_name, "stream opened");
        Ok(stream)
    }
}
