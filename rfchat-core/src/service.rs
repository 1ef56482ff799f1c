//! Chat service identity and its SDP service-name attribute.
//!
//! The attribute blob is `[type tag][name length][UTF-8 name]`, advertised under
//! attribute id 0x0100. A client checks it before trusting a discovered endpoint.

use std::collections::BTreeMap;

use uuid::Uuid;

/// RFCOMM service UUID of the chat service.
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x34B1CF4D_1069_4AD6_89B6_E161D79BE4D8);

/// SDP attribute id carrying the service name.
pub const SERVICE_NAME_ATTRIBUTE_ID: u16 = 0x0100;

/// SDP type descriptor of the service-name attribute: type 4 (text string) in the
/// upper five bits, size index 5 (one-byte length follows) in the lower three.
pub const SERVICE_NAME_ATTRIBUTE_TYPE: u8 = (4 << 3) | 5;

/// Human-readable service name.
pub const SERVICE_NAME: &str = "Bluetooth Rfcomm Chat Service";

/// Raw SDP attributes as exposed by a service: attribute id -> encoded value.
pub type SdpAttributes = BTreeMap<u16, Vec<u8>>;

/// Immutable identity of the chat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_id: Uuid,
    pub service_name: &'static str,
}

/// The one service record this program advertises and connects to.
pub const CHAT_SERVICE: ServiceRecord = ServiceRecord {
    service_id: CHAT_SERVICE_UUID,
    service_name: SERVICE_NAME,
};

impl ServiceRecord {
    /// Service-name attribute value: type tag, byte length, UTF-8 name.
    pub fn attribute_blob(&self) -> Result<Vec<u8>, ServiceRecordError> {
        let name = self.service_name.as_bytes();
        let len = u8::try_from(name.len())
            .map_err(|_| ServiceRecordError::NameTooLong { len: name.len() })?;
        let mut out = Vec::with_capacity(2 + name.len());
        out.push(SERVICE_NAME_ATTRIBUTE_TYPE);
        out.push(len);
        out.extend_from_slice(name);
        Ok(out)
    }

    /// Full attribute set to publish alongside the service.
    pub fn attributes(&self) -> Result<SdpAttributes, ServiceRecordError> {
        let mut attrs = SdpAttributes::new();
        attrs.insert(SERVICE_NAME_ATTRIBUTE_ID, self.attribute_blob()?);
        Ok(attrs)
    }
}

impl Default for ServiceRecord {
    fn default() -> Self {
        CHAT_SERVICE
    }
}

/// Check a peer's advertised attributes and return the service name it claims.
pub fn validate_attributes(attrs: &SdpAttributes) -> Result<String, ServiceRecordError> {
    let blob = attrs
        .get(&SERVICE_NAME_ATTRIBUTE_ID)
        .ok_or(ServiceRecordError::MissingAttribute {
            id: SERVICE_NAME_ATTRIBUTE_ID,
        })?;
    validate_attribute_blob(blob)
}

/// Decode one service-name attribute value.
pub fn validate_attribute_blob(blob: &[u8]) -> Result<String, ServiceRecordError> {
    let (&tag, rest) = blob
        .split_first()
        .ok_or(ServiceRecordError::TruncatedAttribute)?;
    if tag != SERVICE_NAME_ATTRIBUTE_TYPE {
        return Err(ServiceRecordError::UnexpectedAttributeFormat { tag });
    }
    let (&len, rest) = rest
        .split_first()
        .ok_or(ServiceRecordError::TruncatedAttribute)?;
    let name = rest
        .get(..len as usize)
        .ok_or(ServiceRecordError::TruncatedAttribute)?;
    std::str::from_utf8(name)
        .map(str::to_owned)
        .map_err(|_| ServiceRecordError::InvalidName)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceRecordError {
    #[error("service is not advertising the service name attribute (id={id:#06x})")]
    MissingAttribute { id: u16 },
    #[error("service name attribute uses an unexpected format (type tag {tag:#04x})")]
    UnexpectedAttributeFormat { tag: u8 },
    #[error("service name attribute is truncated")]
    TruncatedAttribute,
    #[error("service name is not valid UTF-8")]
    InvalidName,
    #[error("service name of {len} bytes does not fit a one-byte length")]
    NameTooLong { len: usize },
}
