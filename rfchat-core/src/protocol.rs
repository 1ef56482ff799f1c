//! LAN radio datagrams: presence beacons and uncached service queries.
//! Encoding is bincode with a size limit; one message per UDP datagram.

use bincode::Options;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceId;
use crate::service::SdpAttributes;

/// Current datagram protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram accepted or produced.
pub const MAX_DATAGRAM_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Presence: sent periodically to the multicast group by every running radio.
    Beacon {
        protocol_version: u8,
        device_id: DeviceId,
        name: String,
    },
    /// Ask the receiving device whether it currently offers `service_id`.
    ServiceQuery {
        protocol_version: u8,
        query_id: u64,
        service_id: Uuid,
    },
    /// Answer to a query. `offer` is None when the service is not advertised.
    ServiceResponse {
        protocol_version: u8,
        query_id: u64,
        offer: Option<ServiceOffer>,
    },
}

impl Message {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Message::Beacon {
                protocol_version, ..
            }
            | Message::ServiceQuery {
                protocol_version, ..
            }
            | Message::ServiceResponse {
                protocol_version, ..
            } => *protocol_version,
        }
    }
}

/// An advertised service: its raw attributes and the stream port to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffer {
    pub service_id: Uuid,
    pub attributes: SdpAttributes,
    pub channel_port: u16,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DATAGRAM_LEN as u64)
}

pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, DatagramError> {
    options().serialize(msg).map_err(DatagramError::Codec)
}

/// Decode one datagram. Messages from another protocol version are rejected.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, DatagramError> {
    let msg: Message = options().deserialize(bytes).map_err(DatagramError::Codec)?;
    if msg.protocol_version() != PROTOCOL_VERSION {
        return Err(DatagramError::Version(msg.protocol_version()));
    }
    Ok(msg)
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported protocol version {0}")]
    Version(u8),
}
